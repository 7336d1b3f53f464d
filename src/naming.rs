//! Route name generation and validation.
//!
//! Route names look like `brave-otter-k3x9q`: readable enough to spot in
//! logs and nginx configs, random enough that collisions are rare. The store
//! still enforces uniqueness.

use rand::Rng;
use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "bright", "calm", "clever", "cosmic", "crisp", "dapper", "eager",
    "fancy", "fierce", "gentle", "golden", "happy", "humble", "jolly", "keen", "lively", "lucky",
    "mellow", "misty", "nimble", "noble", "plucky", "proud", "quick", "quiet", "rapid", "rustic",
    "shiny", "silent", "snowy", "solar", "spry", "steady", "sunny", "swift", "tidy", "vivid",
    "witty", "zesty",
];

const ANIMALS: &[&str] = &[
    "badger", "bear", "beaver", "bison", "cat", "cobra", "crane", "deer", "dog", "dolphin",
    "eagle", "falcon", "ferret", "finch", "fox", "gecko", "heron", "horse", "ibis", "jaguar",
    "koala", "lemur", "lion", "lynx", "marten", "moose", "newt", "otter", "owl", "panda",
    "puffin", "rabbit", "raven", "seal", "shark", "sloth", "tapir", "tiger", "walrus", "wolf",
    "yak", "zebra",
];

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 5;

/// Longest route name accepted (DNS label length, since it doubles as the
/// container name).
pub const MAX_ROUTE_LEN: usize = 63;

/// Generate a fresh `adjective-animal-xxxxx` route name.
pub fn generate_route_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("owl");
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("{}-{}-{}", adjective, animal, suffix)
}

/// Check that a route name is safe to use as a file name, an nginx
/// location and a container name.
pub fn validate_route_name(route: &str) -> Result<(), String> {
    if route.is_empty() {
        return Err("route name is empty".to_string());
    }
    if route.len() > MAX_ROUTE_LEN {
        return Err(format!(
            "route name is {} characters, limit is {}",
            route.len(),
            MAX_ROUTE_LEN
        ));
    }
    if route.starts_with('-') || route.ends_with('-') {
        return Err("route name must not start or end with '-'".to_string());
    }
    if let Some(c) = route
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(format!("route name contains forbidden character {:?}", c));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_names_have_three_parts() {
        let name = generate_route_name();
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 3, "unexpected shape: {}", name);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(ANIMALS.contains(&parts[1]));
        assert_eq!(parts[2].len(), SUFFIX_LEN);
    }

    #[test]
    fn test_generated_names_validate() {
        for _ in 0..200 {
            let name = generate_route_name();
            assert!(validate_route_name(&name).is_ok(), "{} rejected", name);
        }
    }

    #[test]
    fn test_generated_names_vary() {
        let names: std::collections::HashSet<String> =
            (0..50).map(|_| generate_route_name()).collect();
        assert!(names.len() > 45);
    }

    #[test]
    fn test_validate_rejects_path_tricks() {
        assert!(validate_route_name("").is_err());
        assert!(validate_route_name("../etc").is_err());
        assert!(validate_route_name("a/b").is_err());
        assert!(validate_route_name("Upper").is_err());
        assert!(validate_route_name("has space").is_err());
        assert!(validate_route_name("-leading").is_err());
        assert!(validate_route_name(&"a".repeat(64)).is_err());
        assert!(validate_route_name("room-42").is_ok());
    }
}
