//! Native value types and their byte representation.
//!
//! Every kind is a zero-sized marker implementing [`FieldKind`]. The byte
//! form is what gets encrypted, so it must be stable: changing it makes
//! existing rows unreadable and breaks deterministic lookups.

use chrono::{NaiveDate, NaiveDateTime};

use super::{FieldError, FieldOptions};

/// Largest value an encrypted binary field accepts.
pub const MAX_BINARY_LEN: usize = u32::MAX as usize;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const DATETIME_FORMAT_T: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Conversion between a native value and the plaintext bytes that get encrypted.
pub trait FieldKind: Send + Sync + 'static {
    type Value: Clone + Send + Sync;

    /// Class-style name of the plain field, e.g. `"CharField"`.
    const NAME: &'static str;

    /// Rust type name of [`Self::Value`], for diagnostics.
    const VALUE_TYPE: &'static str;

    fn to_bytes(value: &Self::Value) -> Result<Vec<u8>, FieldError>;

    fn from_bytes(bytes: &[u8]) -> Result<Self::Value, FieldError>;

    /// Value validators (length, format, range).
    fn validate(_value: &Self::Value, _options: &FieldOptions) -> Result<(), FieldError> {
        Ok(())
    }

    /// Reject option combinations this kind cannot work with.
    fn check_options(_options: &FieldOptions) -> Result<(), FieldError> {
        Ok(())
    }

    fn default_max_length() -> Option<usize> {
        None
    }
}

fn utf8(bytes: &[u8]) -> Result<String, FieldError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| FieldError::Decode("stored value is not valid UTF-8".into()))
}

fn utf8_str(bytes: &[u8]) -> Result<&str, FieldError> {
    std::str::from_utf8(bytes).map_err(|_| FieldError::Decode("stored value is not valid UTF-8".into()))
}

fn check_max_length(value: &str, options: &FieldOptions) -> Result<(), FieldError> {
    if let Some(max) = options.max_length {
        let len = value.chars().count();
        if len > max {
            return Err(FieldError::Validation(format!(
                "Ensure this value has at most {max} characters (it has {len})."
            )));
        }
    }
    Ok(())
}

/// Unbounded text.
#[derive(Debug, Clone, Copy)]
pub struct Text;

impl FieldKind for Text {
    type Value = String;
    const NAME: &'static str = "TextField";
    const VALUE_TYPE: &'static str = "String";

    fn to_bytes(value: &String) -> Result<Vec<u8>, FieldError> {
        Ok(value.as_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<String, FieldError> {
        utf8(bytes)
    }
}

/// Text with a mandatory `max_length`.
#[derive(Debug, Clone, Copy)]
pub struct Char;

impl FieldKind for Char {
    type Value = String;
    const NAME: &'static str = "CharField";
    const VALUE_TYPE: &'static str = "String";

    fn to_bytes(value: &String) -> Result<Vec<u8>, FieldError> {
        Ok(value.as_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<String, FieldError> {
        utf8(bytes)
    }

    fn validate(value: &String, options: &FieldOptions) -> Result<(), FieldError> {
        check_max_length(value, options)
    }

    fn check_options(options: &FieldOptions) -> Result<(), FieldError> {
        match options.max_length {
            Some(n) if n > 0 => Ok(()),
            Some(_) => Err(FieldError::ImproperlyConfigured(
                "'max_length' must be a positive integer".into(),
            )),
            None => Err(FieldError::ImproperlyConfigured(
                "CharFields must define a 'max_length' attribute".into(),
            )),
        }
    }
}

/// An email address.
#[derive(Debug, Clone, Copy)]
pub struct Email;

impl FieldKind for Email {
    type Value = String;
    const NAME: &'static str = "EmailField";
    const VALUE_TYPE: &'static str = "String";

    fn to_bytes(value: &String) -> Result<Vec<u8>, FieldError> {
        Ok(value.as_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<String, FieldError> {
        utf8(bytes)
    }

    fn validate(value: &String, options: &FieldOptions) -> Result<(), FieldError> {
        check_max_length(value, options)?;
        if is_valid_email(value) {
            Ok(())
        } else {
            Err(FieldError::Validation("Enter a valid email address.".into()))
        }
    }

    fn default_max_length() -> Option<usize> {
        Some(254)
    }
}

/// An http, https, ftp or ftps URL.
#[derive(Debug, Clone, Copy)]
pub struct Url;

impl FieldKind for Url {
    type Value = String;
    const NAME: &'static str = "URLField";
    const VALUE_TYPE: &'static str = "String";

    fn to_bytes(value: &String) -> Result<Vec<u8>, FieldError> {
        Ok(value.as_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<String, FieldError> {
        utf8(bytes)
    }

    fn validate(value: &String, options: &FieldOptions) -> Result<(), FieldError> {
        check_max_length(value, options)?;
        if is_valid_url(value) {
            Ok(())
        } else {
            Err(FieldError::Validation("Enter a valid URL.".into()))
        }
    }

    fn default_max_length() -> Option<usize> {
        Some(200)
    }
}

/// A signed integer limited to the 32-bit column range.
#[derive(Debug, Clone, Copy)]
pub struct Integer;

impl FieldKind for Integer {
    type Value = i64;
    const NAME: &'static str = "IntegerField";
    const VALUE_TYPE: &'static str = "i64";

    fn to_bytes(value: &i64) -> Result<Vec<u8>, FieldError> {
        Ok(value.to_string().into_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<i64, FieldError> {
        parse_int(bytes)
    }

    fn validate(value: &i64, _options: &FieldOptions) -> Result<(), FieldError> {
        check_range(*value, i64::from(i32::MIN), i64::from(i32::MAX))
    }
}

/// A signed 64-bit integer.
#[derive(Debug, Clone, Copy)]
pub struct BigInteger;

impl FieldKind for BigInteger {
    type Value = i64;
    const NAME: &'static str = "BigIntegerField";
    const VALUE_TYPE: &'static str = "i64";

    fn to_bytes(value: &i64) -> Result<Vec<u8>, FieldError> {
        Ok(value.to_string().into_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<i64, FieldError> {
        parse_int(bytes)
    }
}

fn parse_int(bytes: &[u8]) -> Result<i64, FieldError> {
    utf8_str(bytes)?
        .trim()
        .parse()
        .map_err(|e| FieldError::Decode(format!("stored value is not an integer: {e}")))
}

fn check_range(value: i64, min: i64, max: i64) -> Result<(), FieldError> {
    if value < min {
        return Err(FieldError::Validation(format!(
            "Ensure this value is greater than or equal to {min}."
        )));
    }
    if value > max {
        return Err(FieldError::Validation(format!(
            "Ensure this value is less than or equal to {max}."
        )));
    }
    Ok(())
}

/// A boolean, stored as `True` / `False`.
#[derive(Debug, Clone, Copy)]
pub struct Boolean;

impl FieldKind for Boolean {
    type Value = bool;
    const NAME: &'static str = "BooleanField";
    const VALUE_TYPE: &'static str = "bool";

    fn to_bytes(value: &bool) -> Result<Vec<u8>, FieldError> {
        Ok(if *value { b"True".to_vec() } else { b"False".to_vec() })
    }

    fn from_bytes(bytes: &[u8]) -> Result<bool, FieldError> {
        let s = utf8_str(bytes)?.trim();
        if s.eq_ignore_ascii_case("true") || s == "1" {
            Ok(true)
        } else if s.eq_ignore_ascii_case("false") || s == "0" {
            Ok(false)
        } else {
            Err(FieldError::Decode(format!("`{s}` is not a boolean")))
        }
    }
}

/// A 64-bit float, stored in its shortest round-trip decimal form.
#[derive(Debug, Clone, Copy)]
pub struct Float;

impl FieldKind for Float {
    type Value = f64;
    const NAME: &'static str = "FloatField";
    const VALUE_TYPE: &'static str = "f64";

    fn to_bytes(value: &f64) -> Result<Vec<u8>, FieldError> {
        Ok(value.to_string().into_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<f64, FieldError> {
        utf8_str(bytes)?
            .trim()
            .parse()
            .map_err(|e| FieldError::Decode(format!("stored value is not a float: {e}")))
    }
}

/// A calendar date, `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy)]
pub struct Date;

impl FieldKind for Date {
    type Value = NaiveDate;
    const NAME: &'static str = "DateField";
    const VALUE_TYPE: &'static str = "NaiveDate";

    fn to_bytes(value: &NaiveDate) -> Result<Vec<u8>, FieldError> {
        Ok(value.format(DATE_FORMAT).to_string().into_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<NaiveDate, FieldError> {
        NaiveDate::parse_from_str(utf8_str(bytes)?.trim(), DATE_FORMAT)
            .map_err(|e| FieldError::Decode(format!("stored value is not a date: {e}")))
    }
}

/// A naive date and time, `YYYY-MM-DD HH:MM:SS[.ffffff]`.
#[derive(Debug, Clone, Copy)]
pub struct DateTime;

impl FieldKind for DateTime {
    type Value = NaiveDateTime;
    const NAME: &'static str = "DateTimeField";
    const VALUE_TYPE: &'static str = "NaiveDateTime";

    fn to_bytes(value: &NaiveDateTime) -> Result<Vec<u8>, FieldError> {
        Ok(value.format(DATETIME_FORMAT).to_string().into_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<NaiveDateTime, FieldError> {
        let s = utf8_str(bytes)?.trim();
        NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(s, DATETIME_FORMAT_T))
            .map_err(|e| FieldError::Decode(format!("stored value is not a datetime: {e}")))
    }
}

/// A UUID, stored hyphenated.
#[derive(Debug, Clone, Copy)]
pub struct Uuid;

impl FieldKind for Uuid {
    type Value = uuid::Uuid;
    const NAME: &'static str = "UUIDField";
    const VALUE_TYPE: &'static str = "Uuid";

    fn to_bytes(value: &uuid::Uuid) -> Result<Vec<u8>, FieldError> {
        Ok(value.hyphenated().to_string().into_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<uuid::Uuid, FieldError> {
        uuid::Uuid::parse_str(utf8_str(bytes)?.trim())
            .map_err(|e| FieldError::Decode(format!("stored value is not a UUID: {e}")))
    }
}

/// Any JSON document, stored compact.
#[derive(Debug, Clone, Copy)]
pub struct Json;

impl FieldKind for Json {
    type Value = serde_json::Value;
    const NAME: &'static str = "JSONField";
    const VALUE_TYPE: &'static str = "serde_json::Value";

    fn to_bytes(value: &serde_json::Value) -> Result<Vec<u8>, FieldError> {
        serde_json::to_vec(value).map_err(|e| FieldError::Validation(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<serde_json::Value, FieldError> {
        serde_json::from_slice(bytes)
            .map_err(|e| FieldError::Decode(format!("stored value is not JSON: {e}")))
    }
}

/// Raw bytes, under 2^32 bytes.
#[derive(Debug, Clone, Copy)]
pub struct Binary;

impl FieldKind for Binary {
    type Value = Vec<u8>;
    const NAME: &'static str = "BinaryField";
    const VALUE_TYPE: &'static str = "Vec<u8>";

    fn to_bytes(value: &Vec<u8>) -> Result<Vec<u8>, FieldError> {
        if value.len() > MAX_BINARY_LEN {
            return Err(FieldError::Validation(format!(
                "binary values must be under {} bytes",
                MAX_BINARY_LEN as u64 + 1
            )));
        }
        Ok(value.clone())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Vec<u8>, FieldError> {
        Ok(bytes.to_vec())
    }

    fn validate(value: &Vec<u8>, options: &FieldOptions) -> Result<(), FieldError> {
        let max = options.max_length.unwrap_or(MAX_BINARY_LEN).min(MAX_BINARY_LEN);
        if value.len() > max {
            return Err(FieldError::Validation(format!(
                "Ensure this value has at most {max} bytes (it has {}).",
                value.len()
            )));
        }
        Ok(())
    }
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_alphanumeric() || c == '-')
        })
        && labels
            .last()
            .is_some_and(|tld| tld.chars().all(|c| c.is_alphabetic()) && tld.chars().count() >= 2)
}

fn is_valid_email(value: &str) -> bool {
    let Some((user, domain)) = value.rsplit_once('@') else {
        return false;
    };
    let user_ok = !user.is_empty()
        && !user.starts_with('.')
        && !user.ends_with('.')
        && !user.contains("..")
        && user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+/=?^_`{|}~.-".contains(c));
    user_ok && is_valid_domain(domain)
}

fn is_valid_url(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((scheme, rest)) = value.split_once("://") else {
        return false;
    };
    if !["http", "https", "ftp", "ftps"]
        .iter()
        .any(|s| scheme.eq_ignore_ascii_case(s))
    {
        return false;
    }

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let valid_port = |port: &str| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit());

    if let Some(bracketed) = host_port.strip_prefix('[') {
        let Some((host, after)) = bracketed.split_once(']') else {
            return false;
        };
        let port_ok = after.is_empty() || after.strip_prefix(':').is_some_and(valid_port);
        return port_ok && host.parse::<std::net::Ipv6Addr>().is_ok();
    }

    let host = match host_port.rsplit_once(':') {
        Some((host, port)) if valid_port(port) => host,
        Some(_) => return false,
        None => host_port,
    };
    host.parse::<std::net::Ipv4Addr>().is_ok() || is_valid_domain(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(max_length: Option<usize>) -> FieldOptions {
        let options = FieldOptions::new();
        match max_length {
            Some(n) => options.max_length(n),
            None => options,
        }
    }

    #[test]
    fn text_rejects_invalid_utf8() {
        assert!(matches!(Text::from_bytes(&[0xff, 0xfe]), Err(FieldError::Decode(_))));
        assert_eq!(Text::from_bytes("héllo".as_bytes()).unwrap(), "héllo");
    }

    #[test]
    fn char_requires_max_length() {
        assert!(matches!(
            Char::check_options(&opts(None)),
            Err(FieldError::ImproperlyConfigured(_))
        ));
        assert!(Char::check_options(&opts(Some(10))).is_ok());
    }

    #[test]
    fn char_counts_characters() {
        let o = opts(Some(3));
        assert!(Char::validate(&"äöü".to_string(), &o).is_ok());
        assert!(matches!(
            Char::validate(&"abcd".to_string(), &o),
            Err(FieldError::Validation(_))
        ));
    }

    #[test]
    fn email_validation() {
        let o = opts(Some(254));
        for good in ["test@example.com", "first.last+tag@sub.example.org", "root@localhost"] {
            assert!(Email::validate(&good.to_string(), &o).is_ok(), "{good}");
        }
        for bad in ["", "plain", "@example.com", "a@", "a@b", "a..b@example.com", "a b@example.com"] {
            assert!(Email::validate(&bad.to_string(), &o).is_err(), "{bad}");
        }
    }

    #[test]
    fn url_validation() {
        let o = opts(Some(200));
        for good in [
            "https://example.com",
            "http://example.com:8080/path?q=1#frag",
            "ftp://user:pw@files.example.org/x",
            "http://127.0.0.1/",
            "http://[::1]:80/",
            "http://localhost",
        ] {
            assert!(Url::validate(&good.to_string(), &o).is_ok(), "{good}");
        }
        for bad in ["example.com", "mailto:a@example.com", "https://", "http://exa mple.com", "gopher://example.com"] {
            assert!(Url::validate(&bad.to_string(), &o).is_err(), "{bad}");
        }
    }

    #[test]
    fn integer_range() {
        let o = opts(None);
        assert!(Integer::validate(&2_147_483_647, &o).is_ok());
        assert!(Integer::validate(&-2_147_483_648, &o).is_ok());
        assert!(Integer::validate(&2_147_483_648, &o).is_err());
        assert!(BigInteger::validate(&i64::MAX, &o).is_ok());
    }

    #[test]
    fn integer_bytes_are_decimal() {
        assert_eq!(Integer::to_bytes(&-42).unwrap(), b"-42");
        assert_eq!(BigInteger::from_bytes(b"9223372036854775807").unwrap(), i64::MAX);
        assert!(matches!(Integer::from_bytes(b"4x"), Err(FieldError::Decode(_))));
    }

    #[test]
    fn boolean_forms() {
        assert_eq!(Boolean::to_bytes(&true).unwrap(), b"True");
        assert!(!Boolean::from_bytes(b"false").unwrap());
        assert!(Boolean::from_bytes(b"1").unwrap());
        assert!(Boolean::from_bytes(b"yes").is_err());
    }

    #[test]
    fn float_round_trips_exactly() {
        for v in [0.1, -1.5e-300, 1e300, f64::MAX] {
            assert_eq!(Float::from_bytes(&Float::to_bytes(&v).unwrap()).unwrap(), v);
        }
    }

    #[test]
    fn datetime_formats() {
        let dt = NaiveDate::from_ymd_opt(2023, 5, 17)
            .unwrap()
            .and_hms_micro_opt(13, 4, 5, 120)
            .unwrap();
        assert_eq!(DateTime::to_bytes(&dt).unwrap(), b"2023-05-17 13:04:05.000120");
        assert_eq!(DateTime::from_bytes(b"2023-05-17 13:04:05.000120").unwrap(), dt);
        assert!(DateTime::from_bytes(b"2023-05-17T13:04:05").is_ok());

        let whole = NaiveDate::from_ymd_opt(2023, 5, 17).unwrap().and_hms_opt(1, 2, 3).unwrap();
        assert_eq!(DateTime::to_bytes(&whole).unwrap(), b"2023-05-17 01:02:03");
    }

    #[test]
    fn date_format() {
        let d = NaiveDate::from_ymd_opt(1999, 12, 31).unwrap();
        assert_eq!(Date::to_bytes(&d).unwrap(), b"1999-12-31");
        assert!(Date::from_bytes(b"31/12/1999").is_err());
    }

    #[test]
    fn uuid_is_hyphenated() {
        let id = uuid::Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(Uuid::to_bytes(&id).unwrap(), b"67e55044-10b1-426f-9247-bb680e5fe0c8");
        assert_eq!(Uuid::from_bytes(b"67e5504410b1426f9247bb680e5fe0c8").unwrap(), id);
    }

    #[test]
    fn json_is_compact() {
        let v = serde_json::json!({"a": [1, 2], "b": null});
        assert_eq!(Json::to_bytes(&v).unwrap(), br#"{"a":[1,2],"b":null}"#);
        assert!(Json::from_bytes(b"{").is_err());
    }

    #[test]
    fn binary_max_length() {
        assert!(Binary::validate(&vec![0; 4], &opts(Some(3))).is_err());
        assert!(Binary::validate(&vec![0; 3], &opts(Some(3))).is_ok());
        assert_eq!(Binary::from_bytes(&[0, 255]).unwrap(), vec![0, 255]);
    }
}
