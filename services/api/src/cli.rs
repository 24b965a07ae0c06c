use crate::demo::{run_demo, run_evaluate, run_validate, DemoArgs, EvaluateArgs, ValidateArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use loyalty_engine::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "Loyalty Policy Engine",
    about = "Serve, replay and validate loyalty reward policies from the command line",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Evaluate one event context against a policy document and print the result as JSON
    Evaluate(EvaluateArgs),
    /// Run load-time validation over every policy in a document
    Validate(ValidateArgs),
    /// Walk through the reference reward scenarios against an in-memory catalog
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Evaluate(args) => run_evaluate(args),
        Command::Validate(args) => run_validate(args),
        Command::Demo(args) => run_demo(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_defaults_to_serve() {
        let cli = Cli::try_parse_from(["loyalty-engine-api"]).expect("parses");
        assert!(cli.command.is_none());
    }

    #[test]
    fn evaluate_requires_both_documents() {
        let cli = Cli::try_parse_from([
            "loyalty-engine-api",
            "evaluate",
            "--policies",
            "policies.yaml",
            "--context",
            "event.json",
        ])
        .expect("parses");
        match cli.command {
            Some(Command::Evaluate(args)) => {
                assert_eq!(args.policies.to_str(), Some("policies.yaml"));
                assert_eq!(args.context.to_str(), Some("event.json"));
                assert!(!args.compact);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Cli::try_parse_from(["loyalty-engine-api", "evaluate", "--policies", "p.json"])
            .is_err());
    }

    #[test]
    fn serve_accepts_bind_overrides() {
        let cli = Cli::try_parse_from(["loyalty-engine-api", "serve", "--port", "8080"])
            .expect("parses");
        match cli.command {
            Some(Command::Serve(args)) => {
                assert_eq!(args.port, Some(8080));
                assert!(args.host.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
