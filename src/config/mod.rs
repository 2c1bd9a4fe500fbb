mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;
use vodpack_media::DrmInfo;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<PackagerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: PackagerConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<PackagerConfig> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./vodpack.toml",
        "~/.config/vodpack/config.toml",
        "/etc/vodpack/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            tracing::debug!("Using config file {:?}", path);
            return load_config(path);
        }
    }

    Ok(PackagerConfig::default())
}

/// Validate configuration
pub fn validate_config(config: &PackagerConfig) -> Result<()> {
    let cache = &config.cache;
    if !cache.alignment.is_power_of_two() {
        anyhow::bail!("Cache alignment {} is not a power of two", cache.alignment);
    }
    if cache.buffer_size < cache.alignment {
        anyhow::bail!(
            "Cache buffer size {} is smaller than the alignment {}",
            cache.buffer_size,
            cache.alignment
        );
    }
    if cache.slot_count == 0 {
        anyhow::bail!("Cache slot count cannot be 0");
    }

    if config.output.write_buffer_size == 0 {
        anyhow::bail!("Write buffer size cannot be 0");
    }

    let encryption = &config.encryption;
    if encryption.scheme.is_encrypted() && (encryption.key.is_none() || encryption.key_id.is_none()) {
        anyhow::bail!("Encryption scheme '{}' requires a key and a key id", encryption.scheme);
    }
    // decoding checks hex and lengths
    encryption.drm_info()?;

    Ok(())
}

impl EncryptionConfig {
    /// Key material of the default protection, when both key and key id are set.
    pub fn drm_info(&self) -> Result<Option<DrmInfo>> {
        let (Some(key), Some(key_id)) = (&self.key, &self.key_id) else {
            return Ok(None);
        };

        Ok(Some(DrmInfo {
            key: parse_key("key", key)?,
            key_id: parse_key("key_id", key_id)?,
            iv: self.iv.as_deref().map(|iv| parse_key("iv", iv)).transpose()?,
        }))
    }
}

/// Decode a 16 byte value given as hex.
pub fn parse_key(name: &str, value: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(value.trim()).with_context(|| format!("Invalid hex in {name}"))?;
    match <[u8; 16]>::try_from(bytes.as_slice()) {
        Ok(key) => Ok(key),
        Err(_) => anyhow::bail!("{name} must be 16 bytes, got {}", bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vodpack_common::EncryptionScheme;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn test_defaults_are_valid() {
        let config = PackagerConfig::default();
        validate_config(&config).unwrap();
        assert_eq!(config.cache.alignment, 512);
        assert!(config.output.reuse_buffers);
        assert_eq!(config.encryption.scheme, EncryptionScheme::None);
    }

    #[test]
    fn test_parse_sections() {
        let config: PackagerConfig = toml::from_str(
            r#"
            [cache]
            buffer_size = 4096
            alignment = 4096

            [output]
            single_nalu_per_frame = true

            [encryption]
            scheme = "cbcs"
            key = "000102030405060708090a0b0c0d0e0f"
            key_id = "101112131415161718191a1b1c1d1e1f"
            "#,
        )
        .unwrap();

        validate_config(&config).unwrap();
        assert_eq!(config.cache.buffer_size, 4096);
        assert_eq!(config.cache.slot_count, 2);
        assert!(config.output.single_nalu_per_frame);
        assert!(config.output.reuse_buffers);

        let drm = config.encryption.drm_info().unwrap().unwrap();
        assert_eq!(drm.key[15], 0x0f);
        assert_eq!(drm.key_id[0], 0x10);
        assert_eq!(drm.iv, None);
    }

    #[test]
    fn test_alignment_must_be_power_of_two() {
        let mut config = PackagerConfig::default();
        config.cache.alignment = 1000;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_buffer_smaller_than_alignment() {
        let mut config = PackagerConfig::default();
        config.cache.buffer_size = 256;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_encrypted_scheme_requires_key() {
        let mut config = PackagerConfig::default();
        config.encryption.scheme = EncryptionScheme::Cenc;
        config.encryption.key = Some(KEY.to_string());
        assert!(validate_config(&config).is_err());

        config.encryption.key_id = Some(KEY.to_string());
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_short_key_rejected() {
        let err = parse_key("key", "0011").unwrap_err();
        assert!(err.to_string().contains("16 bytes"));
        assert!(parse_key("key", "zz").is_err());
        assert_eq!(parse_key("iv", KEY).unwrap()[1], 1);
    }
}
