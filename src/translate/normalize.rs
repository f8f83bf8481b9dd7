//! Language detection and chat-text cleanup.
//! Strips control characters and leading transport commands, and lifts emote
//! tokens out of the text so detection and translation only see natural language.
//! Emotes are spliced back into the translation at the same relative position.

use regex::Regex;

/// One candidate language for a piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// ISO 639-1 where known, ISO 639-3 otherwise.
    pub lang: String,
    pub confidence: f64,
}

/// Language identification adapter. Results are ordered best-first and may be empty.
pub trait LanguageDetector: Send + Sync {
    fn detect(&self, text: &str) -> Vec<Detection>;
}

/// Trigram detector backed by whatlang.
pub struct WhatlangDetector;

impl LanguageDetector for WhatlangDetector {
    fn detect(&self, text: &str) -> Vec<Detection> {
        whatlang::detect(text)
            .map(|info| {
                vec![Detection {
                    lang: lang_to_code(info.lang()),
                    confidence: info.confidence(),
                }]
            })
            .unwrap_or_default()
    }
}

fn lang_to_code(lang: whatlang::Lang) -> String {
    use whatlang::Lang::*;
    let code = match lang {
        Eng => "en",
        Cmn => "zh",
        Jpn => "ja",
        Kor => "ko",
        Fra => "fr",
        Deu => "de",
        Spa => "es",
        Rus => "ru",
        Por => "pt",
        Ita => "it",
        Ara => "ar",
        Hin => "hi",
        Tur => "tr",
        Vie => "vi",
        Tha => "th",
        Nld => "nl",
        Pol => "pl",
        Ukr => "uk",
        Swe => "sv",
        Dan => "da",
        Fin => "fi",
        Ces => "cs",
        Ell => "el",
        Heb => "he",
        Ind => "id",
        other => other.code(),
    };
    code.to_string()
}

/// An emote lifted out of a message, with where it sat relative to the words.
#[derive(Debug, Clone, PartialEq)]
pub struct EmoteSlot {
    pub emote: String,
    /// Token index / token count of the original message, in `[0, 1)`.
    pub position: f64,
}

/// Message text ready for detection and translation.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub text: String,
    pub emotes: Vec<EmoteSlot>,
}

impl NormalizedMessage {
    /// Put the emotes back into `translated` at their original relative positions.
    pub fn respliced(&self, translated: &str) -> String {
        if self.emotes.is_empty() {
            return translated.to_string();
        }
        let mut words: Vec<&str> = translated.split_whitespace().collect();
        let total = words.len() + self.emotes.len();
        for slot in &self.emotes {
            let idx = ((slot.position * total as f64).round() as usize).min(words.len());
            words.insert(idx, &slot.emote);
        }
        words.join(" ")
    }
}

pub struct Sanitizer {
    transport_command: Regex,
    emote: Regex,
}

impl Sanitizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // "/me waves", ".me", and CTCP "ACTION" once its \x01 markers are gone
            transport_command: Regex::new(r"^(?:[/.][A-Za-z]+|ACTION)(?:\s+|$)")?,
            emote: Regex::new(r"^\[[^\[\]\s]+\]$")?,
        })
    }

    pub fn normalize(&self, raw: &str) -> NormalizedMessage {
        let cleaned: String = raw
            .chars()
            .filter_map(|c| match c {
                c if c.is_whitespace() => Some(' '),
                c if c.is_control() => None,
                c => Some(c),
            })
            .collect();
        let cleaned = self.transport_command.replace(cleaned.trim_start(), "");

        let tokens: Vec<&str> = cleaned.split_whitespace().collect();
        let count = tokens.len();
        let mut words = Vec::with_capacity(count);
        let mut emotes = Vec::new();
        for (idx, token) in tokens.into_iter().enumerate() {
            if self.emote.is_match(token) {
                emotes.push(EmoteSlot {
                    emote: token.to_string(),
                    position: idx as f64 / count as f64,
                });
            } else {
                words.push(token);
            }
        }

        NormalizedMessage {
            text: words.join(" "),
            emotes,
        }
    }
}
