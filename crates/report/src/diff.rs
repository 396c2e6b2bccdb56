/// Structural diff between two report documents
use serde::{Deserialize, Serialize};

use crate::{Field, FieldKey, ReportDocument, SectionId};

/// One structural change between two documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    SectionAdded {
        section: SectionId,
    },
    SectionRemoved {
        section: SectionId,
    },
    FieldAdded {
        key: FieldKey,
        value: Field,
    },
    FieldRemoved {
        key: FieldKey,
        previous: Field,
    },
    FieldModified {
        key: FieldKey,
        before: Field,
        after: Field,
    },
}

impl Change {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Change::SectionAdded { .. } => "section_added",
            Change::SectionRemoved { .. } => "section_removed",
            Change::FieldAdded { .. } => "field_added",
            Change::FieldRemoved { .. } => "field_removed",
            Change::FieldModified { .. } => "field_modified",
        }
    }
}

/// Compute the changes that turn `before` into `after`.
///
/// Section changes come first for each section, followed by its field changes,
/// all in key order so the output is deterministic.
pub fn diff(before: &ReportDocument, after: &ReportDocument) -> Vec<Change> {
    let mut changes = Vec::new();

    for (section_id, old_section) in &before.sections {
        if !after.sections.contains_key(section_id) {
            changes.push(Change::SectionRemoved {
                section: section_id.clone(),
            });
            for (field_id, field) in &old_section.fields {
                changes.push(Change::FieldRemoved {
                    key: FieldKey {
                        section: section_id.clone(),
                        field: field_id.clone(),
                    },
                    previous: field.clone(),
                });
            }
        }
    }

    for (section_id, new_section) in &after.sections {
        let old_section = before.sections.get(section_id);
        if old_section.is_none() {
            changes.push(Change::SectionAdded {
                section: section_id.clone(),
            });
        }

        for (field_id, new_field) in &new_section.fields {
            let key = FieldKey {
                section: section_id.clone(),
                field: field_id.clone(),
            };
            match old_section.and_then(|s| s.fields.get(field_id)) {
                None => changes.push(Change::FieldAdded {
                    key,
                    value: new_field.clone(),
                }),
                Some(old_field) if old_field != new_field => {
                    changes.push(Change::FieldModified {
                        key,
                        before: old_field.clone(),
                        after: new_field.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        if let Some(old_section) = old_section {
            for (field_id, old_field) in &old_section.fields {
                if !new_section.fields.contains_key(field_id) {
                    changes.push(Change::FieldRemoved {
                        key: FieldKey {
                            section: section_id.clone(),
                            field: field_id.clone(),
                        },
                        previous: old_field.clone(),
                    });
                }
            }
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReportId;

    #[test]
    fn identical_documents_have_no_changes() {
        let id = ReportId::new();
        let doc = ReportDocument::from_fields(id, [(FieldKey::new("findings", "text"), "normal")]);
        assert!(diff(&doc, &doc.clone()).is_empty());
    }

    #[test]
    fn detects_added_modified_and_removed() {
        let id = ReportId::new();
        let before = ReportDocument::from_fields(
            id,
            [
                (FieldKey::new("findings", "text"), "normal"),
                (FieldKey::new("history", "indication"), "pain"),
            ],
        );
        let after = ReportDocument::from_fields(
            id,
            [
                (FieldKey::new("findings", "text"), "abnormal"),
                (FieldKey::new("findings", "measurements"), "5mm"),
                (FieldKey::new("impression", "summary"), "nodule"),
            ],
        );

        let kinds: Vec<_> = diff(&before, &after).iter().map(|c| c.kind_name()).collect();
        assert_eq!(
            kinds,
            vec![
                "section_removed",
                "field_removed",
                "field_added",
                "field_modified",
                "section_added",
                "field_added",
            ]
        );
    }
}
