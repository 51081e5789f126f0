use crate::format::Encoding;

pub const DEFAULT_CACHE_SIZE: usize = 4 << 20;
pub const DEFAULT_STACK_WORDS: usize = 64 * 1024;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 2048;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnrollConfig {
    pub enabled: bool,
    pub threshold: u32,
    pub cache_size: usize,
}

impl Default for UnrollConfig {
    fn default() -> Self {
        Self {
            enabled: crate::unroll::possible(),
            threshold: 1,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub encoding: Encoding,
    pub unroll: UnrollConfig,
    pub stack_words: usize,
    pub max_call_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            unroll: UnrollConfig::default(),
            stack_words: DEFAULT_STACK_WORDS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("CVM_ENCODING") {
            match Encoding::parse(value.trim()) {
                Some(encoding) => self.encoding = encoding,
                None => tracing::warn!("ignoring CVM_ENCODING={value}: expected bytecode|threaded"),
            }
        }
        if let Some(value) = lookup("CVM_UNROLL") {
            match parse_flag(&value) {
                Some(enabled) => self.unroll.enabled = enabled && crate::unroll::possible(),
                None => tracing::warn!("ignoring CVM_UNROLL={value}: expected on|off"),
            }
        }
        if let Some(value) = lookup("CVM_UNROLL_THRESHOLD") {
            match value.trim().parse::<u32>() {
                Ok(threshold) => self.unroll.threshold = threshold,
                Err(_) => tracing::warn!("ignoring CVM_UNROLL_THRESHOLD={value}"),
            }
        }
        if let Some(value) = lookup("CVM_CACHE_SIZE") {
            match parse_size(&value) {
                Some(size) => self.unroll.cache_size = size,
                None => tracing::warn!("ignoring CVM_CACHE_SIZE={value}"),
            }
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(digits) = value.strip_suffix('k') {
        (digits, 1usize << 10)
    } else if let Some(digits) = value.strip_suffix('m') {
        (digits, 1usize << 20)
    } else {
        (value.as_str(), 1)
    };
    digits.parse::<usize>().ok()?.checked_mul(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overlay_applies_valid_values() {
        let mut config = EngineConfig::default();
        config.apply_env(|name| match name {
            "CVM_ENCODING" => Some("threaded".to_string()),
            "CVM_UNROLL" => Some("off".to_string()),
            "CVM_UNROLL_THRESHOLD" => Some("7".to_string()),
            "CVM_CACHE_SIZE" => Some("64k".to_string()),
            _ => None,
        });
        assert_eq!(config.encoding, Encoding::DirectThreaded);
        assert!(!config.unroll.enabled);
        assert_eq!(config.unroll.threshold, 7);
        assert_eq!(config.unroll.cache_size, 64 * 1024);
    }

    #[test]
    fn env_overlay_ignores_garbage() {
        let mut config = EngineConfig::default();
        let before = config.clone();
        config.apply_env(|name| match name {
            "CVM_ENCODING" => Some("sideways".to_string()),
            "CVM_UNROLL_THRESHOLD" => Some("-3".to_string()),
            "CVM_CACHE_SIZE" => Some("lots".to_string()),
            _ => None,
        });
        assert_eq!(config, before);
    }
}
