use anyhow::{Context, Result};

/// Checks if the feature bit is set in the provided bitmap.
/// Returns true if the `feature_bit` is set in the `bitmap`. Returns false if
/// the `feature_bit` is unset or out of bounds.
///
/// The bitmap is little-endian: byte 0 holds bits 0 to 7.
pub fn is_feature_bit_set(bitmap: &[u8], feature_bit: usize) -> bool {
    let byte_index = feature_bit >> 3; // Equivalent to feature_bit / 8
    let bit_index = feature_bit & 7; // Equivalent to feature_bit % 8

    if let Some(&target_byte) = bitmap.get(byte_index) {
        let mask = 1 << bit_index;
        (target_byte & mask) != 0
    } else {
        false
    }
}

/// Checks a feature bit in a big-endian hex feature vector, the way
/// `lightningd` reports peer features.
pub fn has_feature_bit(features_hex: &str, feature_bit: usize) -> Result<bool> {
    let mut bitmap =
        hex::decode(features_hex).with_context(|| format!("invalid features {}", features_hex))?;
    bitmap.reverse();
    Ok(is_feature_bit_set(&bitmap, feature_bit))
}

/// Big-endian hex feature vector with only `feature_bit` set, as expected
/// by the plugin manifest.
pub fn feature_bit_to_hex(feature_bit: usize) -> String {
    let len = feature_bit / 8 + 1;
    let mut bitmap = vec![0u8; len];
    bitmap[len - 1 - feature_bit / 8] = 1 << (feature_bit % 8);
    hex::encode(bitmap)
}
