//! Random identifiers: 128-bit hex strings for session keys and request
//! IDs, and short hex labels for subdomains.

use rand::RngCore;

/// Returns a random 16-byte hex string (32 chars), used for session keys
/// and proxy/HTTP request IDs.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Returns a random 6-character lowercase hex subdomain label.
pub fn generate_subdomain() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut label = hex::encode(bytes);
    label.truncate(6);
    label
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_32_lowercase_hex_chars() {
        let id = generate_id();
        assert_eq!(id.len(), 32);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn subdomain_is_6_hex_chars() {
        let label = generate_subdomain();
        assert_eq!(label.len(), 6);
        assert!(label.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_do_not_collide_trivially() {
        assert_ne!(generate_id(), generate_id());
    }
}
