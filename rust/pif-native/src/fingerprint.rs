//! Build fingerprint decomposition.
//!
//! A fingerprint has the shape
//! ```text
//! google/husky/husky:15/AP41.250105.002/12731906:user/release-keys
//! BRAND /PRODUCT/DEVICE:RELEASE/ID     /INCREMENTAL:TYPE/TAGS
//! ```
//! It is split on `/` first and every segment is then split on `:`. The
//! result must contain exactly eight tokens; anything else is rejected as a
//! whole so a malformed value never sets a subset of the build fields.

/// Build field names, in fingerprint order.
pub const FIELD_NAMES: [&str; 8] = [
    "BRAND",
    "PRODUCT",
    "DEVICE",
    "RELEASE",
    "ID",
    "INCREMENTAL",
    "TYPE",
    "TAGS",
];

/// The eight build fields carried by a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub brand: String,
    pub product: String,
    pub device: String,
    pub release: String,
    pub id: String,
    pub incremental: String,
    pub build_type: String,
    pub tags: String,
}

/// A fingerprint that did not decompose into eight tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintError {
    pub tokens: usize,
}

impl std::fmt::Display for FingerprintError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fingerprint has {} tokens, expected {}",
            self.tokens,
            FIELD_NAMES.len()
        )
    }
}

impl std::error::Error for FingerprintError {}

/// Split a fingerprint on `/`, then every part on `:`.
fn tokens(fingerprint: &str) -> Vec<&str> {
    fingerprint
        .split('/')
        .flat_map(|part| part.split(':'))
        .collect()
}

impl Fingerprint {
    /// Decompose `fingerprint`, all-or-nothing.
    pub fn parse(fingerprint: &str) -> Result<Self, FingerprintError> {
        let tokens = tokens(fingerprint);
        let [brand, product, device, release, id, incremental, build_type, tags] =
            <[&str; 8]>::try_from(tokens.as_slice()).map_err(|_| FingerprintError {
                tokens: tokens.len(),
            })?;

        Ok(Fingerprint {
            brand: brand.to_string(),
            product: product.to_string(),
            device: device.to_string(),
            release: release.to_string(),
            id: id.to_string(),
            incremental: incremental.to_string(),
            build_type: build_type.to_string(),
            tags: tags.to_string(),
        })
    }

    /// `(field name, value)` pairs in fingerprint order.
    pub fn fields(&self) -> [(&'static str, &str); 8] {
        [
            (FIELD_NAMES[0], &self.brand),
            (FIELD_NAMES[1], &self.product),
            (FIELD_NAMES[2], &self.device),
            (FIELD_NAMES[3], &self.release),
            (FIELD_NAMES[4], &self.id),
            (FIELD_NAMES[5], &self.incremental),
            (FIELD_NAMES[6], &self.build_type),
            (FIELD_NAMES[7], &self.tags),
        ]
    }
}
