use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{FieldId, FieldKey, ReportError, ReportId, Result, SectionId};

/// Formatting applied to a char range of a field (bold, italic, critical-finding highlight...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatMark {
    pub start: usize,
    pub length: usize,
    pub style: String,
}

impl FormatMark {
    pub fn end(&self) -> usize {
        self.start + self.length
    }
}

/// One editable field of a report section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Field {
    pub text: String,
    #[serde(default)]
    pub marks: Vec<FormatMark>,
}

impl Field {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            marks: Vec::new(),
        }
    }

    /// Length in chars (edit positions are char indices)
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Section {
    #[serde(default)]
    pub title: Option<String>,
    pub fields: BTreeMap<FieldId, Field>,
}

/// Structured report document: sections of independently editable fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportDocument {
    pub report_id: ReportId,
    pub sections: BTreeMap<SectionId, Section>,
}

impl ReportDocument {
    pub fn new(report_id: ReportId) -> Self {
        Self {
            report_id,
            sections: BTreeMap::new(),
        }
    }

    /// Build a document from `(key, text)` pairs
    pub fn from_fields<I, S>(report_id: ReportId, fields: I) -> Self
    where
        I: IntoIterator<Item = (FieldKey, S)>,
        S: Into<String>,
    {
        let mut doc = Self::new(report_id);
        for (key, text) in fields {
            doc.set_field(&key, Field::new(text));
        }
        doc
    }

    pub fn field(&self, key: &FieldKey) -> Option<&Field> {
        self.sections
            .get(&key.section)
            .and_then(|s| s.fields.get(&key.field))
    }

    pub fn field_mut(&mut self, key: &FieldKey) -> Option<&mut Field> {
        self.sections
            .get_mut(&key.section)
            .and_then(|s| s.fields.get_mut(&key.field))
    }

    /// Text of a field, empty if the field does not exist yet
    pub fn field_text(&self, key: &FieldKey) -> &str {
        self.field(key).map(|f| f.text.as_str()).unwrap_or("")
    }

    /// Get a field, creating its section and the field itself if missing
    pub fn field_entry(&mut self, key: &FieldKey) -> &mut Field {
        self.sections
            .entry(key.section.clone())
            .or_default()
            .fields
            .entry(key.field.clone())
            .or_default()
    }

    pub fn set_field(&mut self, key: &FieldKey, field: Field) {
        *self.field_entry(key) = field;
    }

    pub fn remove_field(&mut self, key: &FieldKey) -> Result<Field> {
        let section = self
            .sections
            .get_mut(&key.section)
            .ok_or_else(|| ReportError::SectionNotFound(key.section.clone()))?;
        section
            .fields
            .remove(&key.field)
            .ok_or_else(|| ReportError::FieldNotFound(key.clone()))
    }

    pub fn remove_section(&mut self, section: &SectionId) -> Result<Section> {
        self.sections
            .remove(section)
            .ok_or_else(|| ReportError::SectionNotFound(section.clone()))
    }

    /// All fields in key order
    pub fn fields(&self) -> impl Iterator<Item = (FieldKey, &Field)> {
        self.sections.iter().flat_map(|(section_id, section)| {
            section.fields.iter().map(move |(field_id, field)| {
                (
                    FieldKey {
                        section: section_id.clone(),
                        field: field_id.clone(),
                    },
                    field,
                )
            })
        })
    }

    pub fn field_count(&self) -> usize {
        self.sections.values().map(|s| s.fields.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_entry_creates_section_and_field() {
        let mut doc = ReportDocument::new(ReportId::new());
        let key = FieldKey::new("findings", "text");
        assert_eq!(doc.field_text(&key), "");

        doc.field_entry(&key).text.push_str("normal");
        assert_eq!(doc.field_text(&key), "normal");
        assert_eq!(doc.field_count(), 1);
    }

    #[test]
    fn remove_missing_field_fails() {
        let mut doc = ReportDocument::new(ReportId::new());
        let key = FieldKey::new("impression", "summary");
        assert!(matches!(
            doc.remove_field(&key),
            Err(ReportError::SectionNotFound(_))
        ));

        doc.set_field(&FieldKey::new("impression", "other"), Field::new("x"));
        assert!(matches!(
            doc.remove_field(&key),
            Err(ReportError::FieldNotFound(_))
        ));
    }

    #[test]
    fn fields_iterate_in_key_order() {
        let doc = ReportDocument::from_fields(
            ReportId::new(),
            [
                (FieldKey::new("impression", "summary"), "b"),
                (FieldKey::new("findings", "text"), "a"),
            ],
        );
        let keys: Vec<_> = doc.fields().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["findings.text", "impression.summary"]);
    }
}
