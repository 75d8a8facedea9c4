use rand::Rng;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const ENCODED_LENGTH: usize = 22;

// Resource ID prefixes
pub const VM_PREFIX: &str = "vm_";
pub const TASK_PREFIX: &str = "task_";
pub const NODE_PREFIX: &str = "node_";

/// Encode 16 bytes as a fixed-length 22-character base62 string.
fn base62_encode(bytes: &[u8; 16]) -> String {
    let mut num = u128::from_be_bytes(*bytes);
    let mut chars = [b'0'; ENCODED_LENGTH];

    for i in (0..ENCODED_LENGTH).rev() {
        chars[i] = ALPHABET[(num % 62) as usize];
        num /= 62;
    }

    chars.iter().map(|&b| b as char).collect()
}

/// Generate a time-sortable prefixed ID: `{prefix}{base62(uuidv7)}`.
pub fn generate_id(prefix: &str) -> String {
    format!("{}{}", prefix, base62_encode(uuid::Uuid::now_v7().as_bytes()))
}

/// Check that `id` carries `prefix` followed by a well-formed base62 body.
pub fn validate_id(id: &str, prefix: &str) -> Result<(), String> {
    let encoded = id
        .strip_prefix(prefix)
        .ok_or_else(|| format!("expected {} prefix: {}", prefix, id))?;
    if encoded.len() != ENCODED_LENGTH {
        return Err(format!(
            "expected {} characters after prefix, got {}",
            ENCODED_LENGTH,
            encoded.len()
        ));
    }
    if let Some(c) = encoded.chars().find(|c| !c.is_ascii_alphanumeric()) {
        return Err(format!("invalid base62 character: {}", c));
    }
    Ok(())
}

/// Random alphanumeric password for a VM's display channel.
pub fn generate_password(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
