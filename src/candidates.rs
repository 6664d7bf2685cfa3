use std::{fmt, str::FromStr};

use thiserror::Error;

pub const PLACEHOLDER: &str = "{}";

/// Known upstream mirrors serving premium channels
pub const DEFAULT_TEMPLATES: [&str; 5] = [
    "https://nfsnew.newkso.ru/nfs/premium{}/mono.m3u8",
    "https://windnew.newkso.ru/wind/premium{}/mono.m3u8",
    "https://zekonew.newkso.ru/zeko/premium{}/mono.m3u8",
    "https://dokko1new.newkso.ru/dokko1/premium{}/mono.m3u8",
    "https://ddy6new.newkso.ru/ddy6/premium{}/mono.m3u8",
];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("URL template `{template}` must contain exactly one `{{}}` placeholder, found {found}")]
pub struct TemplateError {
    template: String,
    found: usize,
}

/// A mirror URL with a single `{}` placeholder for the channel ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate(String);

impl UrlTemplate {
    #[must_use]
    pub fn expand(&self, channel_id: &str) -> String {
        self.0.replacen(PLACEHOLDER, channel_id, 1)
    }

    #[must_use]
    pub fn defaults() -> Vec<Self> {
        DEFAULT_TEMPLATES
            .iter()
            .map(|t| Self((*t).to_string()))
            .collect()
    }
}

impl FromStr for UrlTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let found = s.matches(PLACEHOLDER).count();
        if found != 1 {
            return Err(TemplateError {
                template: s.to_string(),
                found,
            });
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Expands every channel ID against every template, IDs in iteration order and
/// templates in list order
pub fn generate_candidates<'a>(
    channel_ids: impl IntoIterator<Item = &'a String>,
    templates: &[UrlTemplate],
) -> Vec<String> {
    channel_ids
        .into_iter()
        .flat_map(|id| templates.iter().map(move |t| t.expand(id)))
        .collect()
}
