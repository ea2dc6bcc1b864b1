//! Builds deterministic cache keys from a prefix and an optional identifier.
//!
//! Every cached value lives under a key of the form `prefix` + rendered identifier.
//! Scalar identifiers (numbers, booleans, plain strings) are rendered in their natural
//! string form so that keys remain human readable. Anything structured (a struct, a map,
//! a list - or a string which itself is JSON and could therefore be confused with one) is
//! canonicalized to JSON and reduced to a 128 bit digest in lowercase hex. This bounds
//! the key length and normalizes identifiers which would otherwise render differently for
//! equal values.
//!
//! Key construction is a pure function on purpose: it is owned by no cache implementation
//! and can be tested (and substituted) in isolation.
use md5::{Digest, Md5};
use serde::Serialize;
use serde_json::Value;

/// Builds the cache key for the given prefix and optional identifier.
///
/// If no identifier is given, the prefix itself is the key. The prefix must not be empty
/// as otherwise completely unrelated lookups would collide in the store.
///
/// # Examples
///
/// ```
/// # use palisade::keys::build_key;
/// // Scalars are rendered naturally...
/// assert_eq!(build_key("product:", Some(&42)).unwrap(), "product:42");
/// assert_eq!(build_key("flag:", Some(&true)).unwrap(), "flag:true");
/// assert_eq!(build_key("user:", Some(&"admin")).unwrap(), "user:admin");
///
/// // ...an absent identifier yields the prefix itself...
/// assert_eq!(build_key("products", None::<&u64>).unwrap(), "products");
///
/// // ...and structured identifiers are digested into a fixed length suffix.
/// let key = build_key("search:", Some(&vec![1, 2, 3])).unwrap();
/// assert_eq!(key.len(), "search:".len() + 32);
///
/// // An empty prefix is rejected.
/// assert_eq!(build_key("", Some(&42)).is_err(), true);
/// ```
pub fn build_key<I: Serialize + ?Sized>(prefix: &str, id: Option<&I>) -> anyhow::Result<String> {
    if prefix.is_empty() {
        return Err(anyhow::anyhow!("Cannot build a cache key without a prefix!"));
    }

    let id = match id {
        Some(id) => id,
        None => return Ok(prefix.to_owned()),
    };

    let rendered = match serde_json::to_value(id)? {
        Value::Null => String::new(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(string) => {
            if is_json(&string) {
                // A string which is itself JSON is indistinguishable from the canonical
                // encoding of a structured identifier - digest it like one.
                digest_hex(string.as_bytes())
            } else {
                string
            }
        }
        structured => digest_hex(serde_json::to_string(&structured)?.as_bytes()),
    };

    Ok(format!("{}{}", prefix, rendered))
}

/// Determines if the given string carries a JSON document.
fn is_json(candidate: &str) -> bool {
    let trimmed = candidate.trim_start();
    (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<Value>(candidate).is_ok()
}

/// Computes the 128 bit digest of the given bytes, rendered as lowercase hex.
fn digest_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

#[cfg(test)]
mod tests {
    use super::build_key;
    use serde::Serialize;
    use std::collections::BTreeSet;

    #[derive(Serialize)]
    struct Filter {
        category: String,
        min_price: u32,
        in_stock: bool,
    }

    #[test]
    fn scalar_identifiers_are_rendered_naturally() {
        assert_eq!(build_key("order:", Some(&4711)).unwrap(), "order:4711");
        assert_eq!(build_key("order:", Some(&-1)).unwrap(), "order:-1");
        assert_eq!(build_key("ratio:", Some(&0.5)).unwrap(), "ratio:0.5");
        assert_eq!(build_key("flag:", Some(&false)).unwrap(), "flag:false");
        assert_eq!(build_key("user:", Some(&"bob")).unwrap(), "user:bob");
    }

    #[test]
    fn structured_identifiers_are_digested_deterministically() {
        let filter = Filter {
            category: "books".to_owned(),
            min_price: 10,
            in_stock: true,
        };
        let other = Filter {
            category: "books".to_owned(),
            min_price: 12,
            in_stock: true,
        };

        let key = build_key("search:", Some(&filter)).unwrap();
        assert_eq!(key, build_key("search:", Some(&filter)).unwrap());
        assert_ne!(key, build_key("search:", Some(&other)).unwrap());
        assert_eq!(key.len(), "search:".len() + 32);
    }

    #[test]
    fn json_strings_are_treated_as_structured() {
        // A string which happens to contain JSON must not end up verbatim in the key...
        let key = build_key("search:", Some(&"{\"category\":\"books\"}")).unwrap();
        assert_eq!(key.len(), "search:".len() + 32);

        // ...while a plain string is used as is.
        assert_eq!(
            build_key("search:", Some(&"category books")).unwrap(),
            "search:category books"
        );
    }

    #[test]
    fn distinct_identifiers_never_collide() {
        let mut keys = BTreeSet::new();
        for id in 0..1000 {
            let _ = keys.insert(build_key("item:", Some(&id)).unwrap());
            let _ = keys.insert(build_key("item:", Some(&vec![id, id + 1])).unwrap());
        }
        assert_eq!(keys.len(), 2000);
    }
}
