// Registration token signing.

use crate::packet::NodeId;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// `hex(HMAC-SHA256(access_key, node_hex || game_id))`. Both sides of a
/// registration derive the token independently; anything else is denied.
pub fn sign_access_token(node: NodeId, game_id: &str, access_key: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(access_key.as_bytes()).expect("hmac accepts any key length");
    mac.update(node.to_string().as_bytes());
    mac.update(game_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_shape_and_determinism() {
        let node = NodeId::backend(5, 1);
        let a = sign_access_token(node, "game7", "secret");
        let b = sign_access_token(node, "game7", "secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn token_binds_every_input() {
        let node = NodeId::backend(5, 1);
        let base = sign_access_token(node, "game7", "secret");
        assert_ne!(base, sign_access_token(NodeId::backend(5, 2), "game7", "secret"));
        assert_ne!(base, sign_access_token(node, "game8", "secret"));
        assert_ne!(base, sign_access_token(node, "game7", "other"));
    }
}
