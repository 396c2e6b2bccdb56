/// Field-level text edits
/// Positions and lengths are char indices into the field text
use serde::{Deserialize, Serialize};

use crate::{Field, FieldKey, FormatMark, ReportError, Result};

/// A single edit to one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TextEdit {
    Insert {
        position: usize,
        content: String,
    },
    Delete {
        position: usize,
        length: usize,
    },
    Replace {
        position: usize,
        length: usize,
        content: String,
    },
    Format {
        position: usize,
        length: usize,
        style: String,
    },
}

impl TextEdit {
    /// Short name used in logs and audit events
    pub fn kind_name(&self) -> &'static str {
        match self {
            TextEdit::Insert { .. } => "insert",
            TextEdit::Delete { .. } => "delete",
            TextEdit::Replace { .. } => "replace",
            TextEdit::Format { .. } => "format",
        }
    }

    pub fn position(&self) -> usize {
        match self {
            TextEdit::Insert { position, .. }
            | TextEdit::Delete { position, .. }
            | TextEdit::Replace { position, .. }
            | TextEdit::Format { position, .. } => *position,
        }
    }

    /// Replace the whole field with `content`
    pub fn replace_all(field: &Field, content: impl Into<String>) -> Self {
        TextEdit::Replace {
            position: 0,
            length: field.char_len(),
            content: content.into(),
        }
    }

    /// Check the payload independent of any field state
    pub fn validate(&self) -> Result<()> {
        match self {
            TextEdit::Insert { content, .. } if content.is_empty() => Err(
                ReportError::InvalidEdit("insert with empty content".to_string()),
            ),
            TextEdit::Delete { length: 0, .. } => Err(ReportError::InvalidEdit(
                "delete with zero length".to_string(),
            )),
            TextEdit::Format { length: 0, .. } => Err(ReportError::InvalidEdit(
                "format with zero length".to_string(),
            )),
            TextEdit::Format { style, .. } if style.trim().is_empty() => Err(
                ReportError::InvalidEdit("format without style".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Apply this edit to `field`, leaving it untouched on error
    pub fn apply(&self, key: &FieldKey, field: &mut Field) -> Result<()> {
        self.validate()?;
        let len = field.char_len();
        let out_of_bounds = |position: usize| ReportError::OutOfBounds {
            key: key.clone(),
            position,
            len,
        };

        match self {
            TextEdit::Insert { position, content } => {
                if *position > len {
                    return Err(out_of_bounds(*position));
                }
                insert_chars(field, *position, content);
            }
            TextEdit::Delete { position, length } => {
                let end = position
                    .checked_add(*length)
                    .ok_or_else(|| out_of_bounds(*position))?;
                if end > len {
                    return Err(out_of_bounds(end));
                }
                delete_chars(field, *position, *length);
            }
            TextEdit::Replace {
                position,
                length,
                content,
            } => {
                let end = position
                    .checked_add(*length)
                    .ok_or_else(|| out_of_bounds(*position))?;
                if end > len {
                    return Err(out_of_bounds(end));
                }
                delete_chars(field, *position, *length);
                insert_chars(field, *position, content);
            }
            TextEdit::Format {
                position,
                length,
                style,
            } => {
                let end = position
                    .checked_add(*length)
                    .ok_or_else(|| out_of_bounds(*position))?;
                if end > len {
                    return Err(out_of_bounds(end));
                }
                field.marks.retain(|m| {
                    !(m.start == *position && m.length == *length && m.style == *style)
                });
                field.marks.push(FormatMark {
                    start: *position,
                    length: *length,
                    style: style.clone(),
                });
                field.marks.sort_by_key(|m| (m.start, m.length));
            }
        }
        Ok(())
    }
}

fn byte_offset(text: &str, char_idx: usize) -> usize {
    text.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

fn insert_chars(field: &mut Field, position: usize, content: &str) {
    if content.is_empty() {
        return;
    }
    let at = byte_offset(&field.text, position);
    field.text.insert_str(at, content);

    let inserted = content.chars().count();
    for mark in &mut field.marks {
        if mark.start >= position {
            mark.start += inserted;
        } else if mark.end() > position {
            mark.length += inserted;
        }
    }
}

fn delete_chars(field: &mut Field, position: usize, length: usize) {
    if length == 0 {
        return;
    }
    let start = byte_offset(&field.text, position);
    let end = byte_offset(&field.text, position + length);
    field.text.replace_range(start..end, "");

    let del_end = position + length;
    for mark in &mut field.marks {
        let mark_end = mark.end();
        let overlap_start = mark.start.max(position);
        let overlap_end = mark_end.min(del_end);
        let overlap = overlap_end.saturating_sub(overlap_start);
        mark.length -= overlap;
        if mark.start >= del_end {
            mark.start -= length;
        } else if mark.start > position {
            mark.start = position;
        }
    }
    field.marks.retain(|m| m.length > 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FieldKey {
        FieldKey::new("findings", "text")
    }

    #[test]
    fn insert_into_empty_field() {
        let mut field = Field::default();
        TextEdit::Insert {
            position: 0,
            content: "normal".into(),
        }
        .apply(&key(), &mut field)
        .unwrap();
        assert_eq!(field.text, "normal");
    }

    #[test]
    fn positions_are_char_indices() {
        let mut field = Field::new("größe 5mm");
        TextEdit::Replace {
            position: 6,
            length: 3,
            content: "7mm".into(),
        }
        .apply(&key(), &mut field)
        .unwrap();
        assert_eq!(field.text, "größe 7mm");
    }

    #[test]
    fn delete_out_of_bounds_leaves_field_untouched() {
        let mut field = Field::new("abc");
        let err = TextEdit::Delete {
            position: 2,
            length: 5,
        }
        .apply(&key(), &mut field)
        .unwrap_err();
        assert!(matches!(err, ReportError::OutOfBounds { .. }));
        assert_eq!(field.text, "abc");
    }

    #[test]
    fn empty_insert_is_invalid() {
        let edit = TextEdit::Insert {
            position: 0,
            content: String::new(),
        };
        assert!(matches!(edit.validate(), Err(ReportError::InvalidEdit(_))));
    }

    #[test]
    fn marks_follow_text_edits() {
        let mut field = Field::new("no acute fracture");
        TextEdit::Format {
            position: 3,
            length: 5,
            style: "bold".into(),
        }
        .apply(&key(), &mut field)
        .unwrap();

        TextEdit::Insert {
            position: 0,
            content: "There is ".into(),
        }
        .apply(&key(), &mut field)
        .unwrap();
        assert_eq!(field.marks[0].start, 12);
        assert_eq!(field.marks[0].length, 5);

        // delete the whole marked word
        TextEdit::Delete {
            position: 12,
            length: 6,
        }
        .apply(&key(), &mut field)
        .unwrap();
        assert_eq!(field.text, "There is no fracture");
        assert!(field.marks.is_empty());
    }
}
