use once_cell::sync::Lazy;
use rand::Rng;

/// Uppercase letters and digits minus the easily confused I, L, O, 0 and 1.
pub const SHARE_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
pub const SHARE_CODE_LEN: usize = 8;

static SHARE_CODE_RE: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"^[ABCDEFGHJKMNPQRSTUVWXYZ2-9]{8}$").expect("valid share code regex")
});

pub fn generate_share_code() -> String {
    let mut rng = rand::rng();
    (0..SHARE_CODE_LEN)
        .map(|_| SHARE_CODE_ALPHABET[rng.random_range(0..SHARE_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Codes are typed by hand, so surrounding whitespace and case are forgiven.
pub fn normalize_share_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

pub fn is_well_formed(code: &str) -> bool {
    SHARE_CODE_RE.is_match(code)
}
