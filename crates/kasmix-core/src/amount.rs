//! Sompi amounts and their decimal-string encoding.
//!
//! All arithmetic inside the service is plain `u64` sompi. Amounts only
//! become strings at storage and wire boundaries, where 64-bit integers
//! would otherwise be at the mercy of JSON number precision. The
//! [`sompi_string`] serde module implements that boundary encoding and
//! accepts both strings and integer numbers on the way in.

use crate::constants::SOMPI_PER_KAS;
use crate::error::AmountError;

/// Serde adapter serialising `u64` sompi as a decimal string.
///
/// Deserialisation is tolerant: both `"12345"` and `12345` are accepted,
/// since older persisted files and foreign tools emit plain numbers.
pub mod sompi_string {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        struct SompiVisitor;

        impl Visitor<'_> for SompiVisitor {
            type Value = u64;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal string or unsigned integer amount")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
                v.parse::<u64>()
                    .map_err(|_| E::custom(format!("invalid sompi amount: {v:?}")))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
                Ok(v)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
                u64::try_from(v).map_err(|_| E::custom(format!("negative sompi amount: {v}")))
            }
        }

        deserializer.deserialize_any(SompiVisitor)
    }
}

/// Like [`sompi_string`] but for `Option<u64>` fields.
pub mod sompi_string_opt {
    use serde::de::Deserializer;
    use serde::{Deserialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super::sompi_string")] u64);

        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
    }
}

/// Parse a human KAS amount string (e.g. `"1.5"`) into sompi.
///
/// Accepts at most 8 fractional digits. Rejects negatives, empty strings,
/// and anything that would overflow `u64`.
pub fn kas_to_sompi(s: &str) -> Result<u64, AmountError> {
    let s = s.trim();
    if s.is_empty() || s == "." {
        return Err(AmountError::Invalid(s.to_string()));
    }

    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if frac.len() > 8 {
        return Err(AmountError::TooManyDecimals(frac.len()));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(AmountError::Invalid(s.to_string()));
    }

    let whole_part: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| AmountError::Overflow)?
    };

    // Right-pad the fraction to 8 digits: "5" -> 50_000_000 sompi.
    let mut frac_padded = frac.to_string();
    while frac_padded.len() < 8 {
        frac_padded.push('0');
    }
    let frac_part: u64 = if frac_padded.is_empty() {
        0
    } else {
        frac_padded.parse().map_err(|_| AmountError::Overflow)?
    };

    whole_part
        .checked_mul(SOMPI_PER_KAS)
        .and_then(|v| v.checked_add(frac_part))
        .ok_or(AmountError::Overflow)
}

/// Format sompi as a KAS string with trailing zeros trimmed (`"1.5"`, `"3"`).
pub fn sompi_to_kas_string(sompi: u64) -> String {
    let whole = sompi / SOMPI_PER_KAS;
    let frac = sompi % SOMPI_PER_KAS;
    if frac == 0 {
        return whole.to_string();
    }
    let frac_str = format!("{frac:08}");
    format!("{whole}.{}", frac_str.trim_end_matches('0'))
}
