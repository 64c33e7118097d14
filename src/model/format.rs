use super::{RecordKey, SourceId};
use serde::Serialize;

/// One language's rendering of a format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatTranslation {
    pub language: String,
    pub key_string: String,
    pub name: String,
    pub description: Option<String>,
}

/// A meeting format as defined by one source, with every translation the
/// source publishes. Translations are kept sorted by language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Format {
    pub source_id: SourceId,
    pub local_id: i64,
    pub kind: Option<String>,
    pub world_id: Option<String>,
    pub translations: Vec<FormatTranslation>,
}

impl Format {
    pub fn new(source_id: SourceId, local_id: i64) -> Self {
        Self {
            source_id,
            local_id,
            kind: None,
            world_id: None,
            translations: Vec::new(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.source_id, self.local_id)
    }

    /// Adds or replaces the translation for its language.
    pub fn set_translation(&mut self, translation: FormatTranslation) {
        match self
            .translations
            .binary_search_by(|t| t.language.as_str().cmp(&translation.language))
        {
            Ok(index) => self.translations[index] = translation,
            Err(index) => self.translations.insert(index, translation),
        }
    }

    pub fn translation(&self, language: &str) -> Option<&FormatTranslation> {
        self.translations.iter().find(|t| t.language == language)
    }
}

#[cfg(test)]
pub(crate) fn test_format(source_id: i64, local_id: i64, key_string: &str) -> Format {
    let mut format = Format::new(SourceId(source_id), local_id);
    format.kind = Some("FC3".to_string());
    format.set_translation(FormatTranslation {
        language: "en".to_string(),
        key_string: key_string.to_string(),
        name: format!("Format {}", key_string),
        description: None,
    });
    format
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translation(language: &str, key: &str) -> FormatTranslation {
        FormatTranslation {
            language: language.to_string(),
            key_string: key.to_string(),
            name: key.to_string(),
            description: None,
        }
    }

    #[test]
    fn translations_stay_sorted_and_unique() {
        let mut format = Format::new(SourceId(1), 4);
        format.set_translation(translation("it", "A"));
        format.set_translation(translation("de", "O"));
        format.set_translation(translation("en", "O"));
        format.set_translation(translation("it", "Ap"));

        let languages: Vec<&str> = format.translations.iter().map(|t| t.language.as_str()).collect();
        assert_eq!(languages, vec!["de", "en", "it"]);
        assert_eq!(format.translation("it").unwrap().key_string, "Ap");
        assert!(format.translation("fr").is_none());
    }
}
