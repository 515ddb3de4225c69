use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Derives the snapshot shuffle seed. The hash input mixes the student,
/// the test, the build time, and a random salt, so the order is
/// reproducible from the stored seed but not predictable across attempts.
pub fn derive_shuffle_seed(user_id: Uuid, test_id: Uuid) -> u64 {
    let salt: u64 = rand::thread_rng().gen();
    let millis = chrono::Utc::now().timestamp_millis();
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}:{}", user_id, test_id, millis, salt));
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

pub fn seed_to_hex(seed: u64) -> String {
    hex::encode(seed.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_differ_across_calls_for_same_inputs() {
        let user = Uuid::new_v4();
        let test = Uuid::new_v4();
        // Random salt makes back-to-back builds diverge.
        assert_ne!(
            derive_shuffle_seed(user, test),
            derive_shuffle_seed(user, test)
        );
    }

    #[test]
    fn seed_hex_is_sixteen_chars() {
        assert_eq!(seed_to_hex(0xdead_beef).len(), 16);
    }
}
