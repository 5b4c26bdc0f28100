#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kinds of business content the engine indexes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "lowercase")]
pub enum ContentType {
    Menu,
    Policy,
    Faq,
    Business,
}

impl ContentType {
    pub const ALL: [ContentType; 4] = [
        ContentType::Menu,
        ContentType::Policy,
        ContentType::Faq,
        ContentType::Business,
    ];

    /// Stable lowercase form, matching the database encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Menu => "menu",
            ContentType::Policy => "policy",
            ContentType::Faq => "faq",
            ContentType::Business => "business",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "menu" => Ok(ContentType::Menu),
            "policy" => Ok(ContentType::Policy),
            "faq" => Ok(ContentType::Faq),
            "business" => Ok(ContentType::Business),
            other => Err(format!("unknown content type: {other:?}")),
        }
    }
}

/// Typed per-content-type payload carried by indexing jobs and stored as the
/// embedding's metadata. Unknown fields land in each variant's extension map
/// rather than being dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ContentPayload {
    Menu(MenuItem),
    Policy(PolicyClause),
    Faq(FaqEntry),
    Business(BusinessProfile),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyClause {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FaqEntry {
    pub question: String,
    #[serde(default)]
    pub answer: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BusinessProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ContentPayload {
    pub fn content_type(&self) -> ContentType {
        match self {
            ContentPayload::Menu(_) => ContentType::Menu,
            ContentPayload::Policy(_) => ContentType::Policy,
            ContentPayload::Faq(_) => ContentType::Faq,
            ContentPayload::Business(_) => ContentType::Business,
        }
    }

    /// Display name surfaced in search results.
    pub fn title(&self) -> &str {
        match self {
            ContentPayload::Menu(item) => &item.name,
            ContentPayload::Policy(clause) => &clause.title,
            ContentPayload::Faq(entry) => &entry.question,
            ContentPayload::Business(profile) => &profile.name,
        }
    }

    /// Canonical text embedded for this payload. The field order is fixed so
    /// identical payloads always embed identical text.
    pub fn embedding_text(&self) -> String {
        match self {
            ContentPayload::Menu(item) => {
                let mut text = item.name.clone();
                if !item.description.trim().is_empty() {
                    text.push_str(". ");
                    text.push_str(item.description.trim());
                }
                if let Some(category) = item.category.as_deref().filter(|c| !c.trim().is_empty()) {
                    text.push_str(". Category: ");
                    text.push_str(category.trim());
                }
                if let Some(price) = item.price {
                    text.push_str(&format!(". Price: {price:.2}"));
                }
                text
            }
            ContentPayload::Policy(clause) => {
                let mut text = clause.title.clone();
                if let Some(category) = clause.category.as_deref().filter(|c| !c.trim().is_empty())
                {
                    text.push_str(" (");
                    text.push_str(category.trim());
                    text.push(')');
                }
                if !clause.body.trim().is_empty() {
                    text.push_str(". ");
                    text.push_str(clause.body.trim());
                }
                text
            }
            ContentPayload::Faq(entry) => {
                let mut text = format!("Q: {}", entry.question.trim());
                if !entry.answer.trim().is_empty() {
                    text.push_str(" A: ");
                    text.push_str(entry.answer.trim());
                }
                text
            }
            ContentPayload::Business(profile) => {
                let mut text = profile.name.clone();
                if !profile.description.trim().is_empty() {
                    text.push_str(". ");
                    text.push_str(profile.description.trim());
                }
                if let Some(hours) = profile.hours.as_deref().filter(|h| !h.trim().is_empty()) {
                    text.push_str(". Hours: ");
                    text.push_str(hours.trim());
                }
                text
            }
        }
    }

    pub fn to_metadata(&self) -> crate::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Pull a display title out of stored metadata without deserializing the
/// whole payload; falls back to the content id when the expected field is
/// missing.
pub fn title_from_metadata(
    content_type: ContentType,
    metadata: &serde_json::Value,
    content_id: &str,
) -> String {
    let field = match content_type {
        ContentType::Menu | ContentType::Business => "name",
        ContentType::Policy => "title",
        ContentType::Faq => "question",
    };

    metadata
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map_or_else(|| content_id.to_string(), |s| s.to_string())
}
