//! # Response Languages
//!
//! Clients pick the language of the answer (and of any in-band error message)
//! per request. The same value selects the synthesis voice and the recognition
//! locale, so it lives in one small shared module.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Languages the assistant can answer, speak, and transcribe in.
///
/// ## Wire format:
/// Serialized as `"english"`, `"chinese"`, `"malay"` or `"tamil"`. Short codes
/// (`"en"`, `"zh"`, `"ms"`, `"ta"`) and locale tags (`"en-US"`, `"zh-CN"`,
/// `"ms-MY"`, `"ta-IN"`) are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    #[serde(alias = "en", alias = "en-US", alias = "en-us")]
    English,
    #[serde(alias = "zh", alias = "zh-CN", alias = "zh-cn")]
    Chinese,
    #[serde(alias = "ms", alias = "ms-MY", alias = "ms-my")]
    Malay,
    #[serde(alias = "ta", alias = "ta-IN", alias = "ta-in")]
    Tamil,
}

impl Language {
    /// BCP-47 locale used for synthesis and recognition.
    pub fn locale(&self) -> &'static str {
        match self {
            Language::English => "en-US",
            Language::Chinese => "zh-CN",
            Language::Malay => "ms-MY",
            Language::Tamil => "ta-IN",
        }
    }

    /// ISO 639-1 code, as expected by transcription endpoints.
    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Chinese => "zh",
            Language::Malay => "ms",
            Language::Tamil => "ta",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::English => write!(f, "english"),
            Language::Chinese => write!(f, "chinese"),
            Language::Malay => write!(f, "malay"),
            Language::Tamil => write!(f, "tamil"),
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "english" | "en" | "en-us" => Ok(Language::English),
            "chinese" | "zh" | "zh-cn" => Ok(Language::Chinese),
            "malay" | "ms" | "ms-my" => Ok(Language::Malay),
            "tamil" | "ta" | "ta-in" => Ok(Language::Tamil),
            other => Err(format!("unsupported language: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("Chinese".parse::<Language>().unwrap(), Language::Chinese);
        assert_eq!("zh-CN".parse::<Language>().unwrap(), Language::Chinese);
        assert_eq!("en".parse::<Language>().unwrap(), Language::English);
        assert_eq!("ms-MY".parse::<Language>().unwrap(), Language::Malay);
        assert_eq!("Tamil".parse::<Language>().unwrap(), Language::Tamil);
        assert!("klingon".parse::<Language>().is_err());
    }

    #[test]
    fn test_serde_accepts_short_codes() {
        let language: Language = serde_json::from_str("\"zh\"").unwrap();
        assert_eq!(language, Language::Chinese);
        assert_eq!(serde_json::to_string(&Language::English).unwrap(), "\"english\"");
        let language: Language = serde_json::from_str("\"ta\"").unwrap();
        assert_eq!(language.locale(), "ta-IN");
        assert_eq!(serde_json::to_string(&Language::Malay).unwrap(), "\"malay\"");
    }
}
