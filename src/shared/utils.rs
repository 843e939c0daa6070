use rand::Rng;

/// 6-digit numeric PIN used for WhatsApp phone registration.
pub fn generate_pin() -> u32 {
    rand::thread_rng().gen_range(100_000..=999_999)
}

/// Cryptographically random hex verification token (9 random bytes).
pub fn verification_token() -> String {
    let mut bytes = [0u8; 9];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
