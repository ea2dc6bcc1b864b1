//! Encodes and decodes cached values to and from their stored textual form.
//!
//! The backing store only deals in opaque byte strings. Scalars (numbers, booleans, plain
//! strings) are stored in their natural textual form so that they remain readable with
//! any store inspection tool. Structured values are stored as self-describing JSON so
//! that [decode](decode) can reconstruct them without an external schema.
//!
//! An empty stored string decodes to the zero value of the target type. This is how
//! negative results (a confirmed absence in the source of truth) are represented without
//! a dedicated sentinel type.
//!
//! Like key construction, these are standalone pure functions: `decode(encode(v)) == v`
//! holds for every representable value.
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Encodes the given value into its stored textual form.
///
/// # Examples
///
/// ```
/// # use palisade::values::encode;
/// // Scalars encode to their natural form...
/// assert_eq!(encode(&42).unwrap(), "42");
/// assert_eq!(encode(&true).unwrap(), "true");
/// assert_eq!(encode(&"telescope").unwrap(), "telescope");
///
/// // ...structured values encode to self-describing JSON.
/// assert_eq!(encode(&vec![1, 2, 3]).unwrap(), "[1,2,3]");
/// ```
pub fn encode<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<String> {
    match serde_json::to_value(value)? {
        Value::Null => Ok(String::new()),
        Value::Bool(flag) => Ok(flag.to_string()),
        Value::Number(number) => Ok(number.to_string()),
        Value::String(string) => {
            if serde_json::from_str::<Value>(&string).is_ok() {
                // The raw text would be mistaken for a number, boolean or document when
                // read back - keep it as a JSON string so the round-trip holds.
                Ok(serde_json::to_string(&string)?)
            } else {
                Ok(string)
            }
        }
        structured => Ok(serde_json::to_string(&structured)?),
    }
}

/// Decodes a value from its stored textual form.
///
/// An empty input yields the zero value of the target type, which is how negative cache
/// results are materialized.
///
/// # Examples
///
/// ```
/// # use palisade::values::{decode, encode};
/// assert_eq!(decode::<i64>("42").unwrap(), 42);
/// assert_eq!(decode::<String>("telescope").unwrap(), "telescope");
/// assert_eq!(decode::<Vec<i64>>("[1,2,3]").unwrap(), vec![1, 2, 3]);
///
/// // The zero value is produced for empty inputs...
/// assert_eq!(decode::<i64>("").unwrap(), 0);
/// assert_eq!(decode::<Vec<i64>>("").unwrap(), Vec::<i64>::new());
///
/// // ...and the round-trip law holds even for awkward strings.
/// let tricky = "42".to_owned();
/// assert_eq!(decode::<String>(&encode(&tricky).unwrap()).unwrap(), tricky);
/// ```
pub fn decode<T: DeserializeOwned + Default>(raw: &str) -> anyhow::Result<T> {
    if raw.is_empty() {
        return Ok(T::default());
    }

    match serde_json::from_str(raw) {
        Ok(value) => Ok(value),
        // Plain strings are stored without quotes and therefore aren't valid JSON. Wrap
        // the raw text into a JSON string and try again - this either produces the target
        // type or reports why the stored bytes don't fit it.
        Err(_) => Ok(serde_json::from_value(Value::String(raw.to_owned()))?),
    }
}

#[cfg(test)]
mod tests {
    use super::{decode, encode};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone)]
    struct Product {
        id: u64,
        name: String,
        tags: Vec<String>,
    }

    fn example_product() -> Product {
        Product {
            id: 7,
            name: "Telescope".to_owned(),
            tags: vec!["optics".to_owned(), "outdoor".to_owned()],
        }
    }

    #[test]
    fn scalars_round_trip() {
        assert_eq!(decode::<i64>(&encode(&-17i64).unwrap()).unwrap(), -17);
        assert_eq!(decode::<u64>(&encode(&17u64).unwrap()).unwrap(), 17);
        assert_eq!(decode::<bool>(&encode(&true).unwrap()).unwrap(), true);
        assert_eq!(decode::<f64>(&encode(&1.25f64).unwrap()).unwrap(), 1.25);
        assert_eq!(
            decode::<String>(&encode("hello world").unwrap()).unwrap(),
            "hello world"
        );
    }

    #[test]
    fn ambiguous_strings_round_trip() {
        // Strings which look like other scalars or like JSON must survive the round-trip
        // unchanged...
        for tricky in ["42", "true", "null", "[1,2]", "{\"a\":1}", "0.5"] {
            let value = tricky.to_owned();
            assert_eq!(decode::<String>(&encode(&value).unwrap()).unwrap(), value);
        }
    }

    #[test]
    fn structured_values_round_trip() {
        let product = example_product();
        let encoded = encode(&product).unwrap();
        assert_eq!(decode::<Product>(&encoded).unwrap(), product);

        let list = vec![example_product(), Product::default()];
        let encoded = encode(&list).unwrap();
        assert_eq!(decode::<Vec<Product>>(&encoded).unwrap(), list);
    }

    #[test]
    fn empty_input_yields_zero_values() {
        assert_eq!(decode::<i64>("").unwrap(), 0);
        assert_eq!(decode::<String>("").unwrap(), "");
        assert_eq!(decode::<Product>("").unwrap(), Product::default());
        assert_eq!(decode::<Vec<Product>>("").unwrap(), Vec::new());
    }

    #[test]
    fn malformed_input_is_reported() {
        assert_eq!(decode::<Product>("{\"id\": oops").is_err(), true);
        assert_eq!(decode::<Vec<i64>>("[1, 2").is_err(), true);
    }
}
