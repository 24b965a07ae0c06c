//! Serde adapter for [`Decimal`] fields carried as JSON/YAML numbers.
//!
//! Integral values are written as integers so amounts above 2^53 survive a round trip; only
//! fractional values go out as floats. Input accepts integers, floats and numeric strings, and
//! integer literals are read without passing through `f64`.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub fn serialize<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if value.fract().is_zero() {
        if let Some(integer) = value.to_i64() {
            return serializer.serialize_i64(integer);
        }
        if let Some(integer) = value.to_u64() {
            return serializer.serialize_u64(integer);
        }
    }
    rust_decimal::serde::float::serialize(value, serializer)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    <Decimal as Deserialize>::deserialize(deserializer)
}

struct Number<'a>(&'a Decimal);

impl Serialize for Number<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize(self.0, serializer)
    }
}

pub mod option {
    use super::*;

    pub fn serialize<S>(value: &Option<Decimal>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(value) => serializer.serialize_some(&Number(value)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<Decimal>::deserialize(deserializer)
    }
}
