//! Remote dictionary source client.
//!
//! Wraps the free dictionary HTTP API. The daemon keeps one warm
//! [`reqwest::Client`] for its whole lifetime so repeated lookups skip
//! connection setup.

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::SourceConfig;
use crate::protocol::{Entry, LookupResponse, Sense};

pub struct DictSource {
    endpoint: String,
    client: Client,
}

impl DictSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Look up a word or phrase against the remote source.
    ///
    /// "No entry" is a valid answer, returned as a `found == false`
    /// response; only transport and decode failures are errors.
    pub async fn lookup(&self, query: &str) -> Result<LookupResponse> {
        let url = format!("{}/{}", self.endpoint, query);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach dictionary source")?;

        if response.status() == StatusCode::NOT_FOUND {
            let miss: ApiMiss = response.json().await.unwrap_or_default();
            return Ok(LookupResponse::missing(miss.prompt(query)));
        }

        if !response.status().is_success() {
            return Err(anyhow!(
                "dictionary source returned status {}",
                response.status()
            ));
        }

        let api_entries: Vec<ApiEntry> = response
            .json()
            .await
            .context("Failed to parse dictionary response")?;

        let entries: Vec<Entry> = api_entries.into_iter().map(Entry::from).collect();
        if entries.is_empty() {
            return Ok(LookupResponse::missing(format!("No entry for `{query}`")));
        }

        Ok(LookupResponse::found(entries))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Debug, Deserialize)]
struct ApiEntry {
    word: String,
    #[serde(default)]
    phonetic: Option<String>,
    #[serde(default)]
    meanings: Vec<ApiMeaning>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMeaning {
    part_of_speech: String,
    #[serde(default)]
    definitions: Vec<ApiDefinition>,
}

#[derive(Debug, Deserialize)]
struct ApiDefinition {
    definition: String,
}

/// Body of the source's 404 answer.
#[derive(Debug, Default, Deserialize)]
struct ApiMiss {
    #[serde(default)]
    message: Option<String>,
}

impl ApiMiss {
    fn prompt(&self, query: &str) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("No entry for `{query}`"))
    }
}

impl From<ApiEntry> for Entry {
    fn from(api: ApiEntry) -> Self {
        Entry {
            word: api.word,
            phonetic: api.phonetic,
            senses: api
                .meanings
                .into_iter()
                .map(|m| Sense {
                    part_of_speech: m.part_of_speech,
                    definitions: m.definitions.into_iter().map(|d| d.definition).collect(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_entry_conversion() {
        let json = r#"{
            "word": "hello",
            "phonetic": "/həˈləʊ/",
            "meanings": [
                {
                    "partOfSpeech": "exclamation",
                    "definitions": [
                        {"definition": "used as a greeting", "example": "hello there"}
                    ]
                }
            ]
        }"#;
        let api: ApiEntry = serde_json::from_str(json).unwrap();
        let entry = Entry::from(api);
        assert_eq!(entry.word, "hello");
        assert_eq!(entry.senses.len(), 1);
        assert_eq!(entry.senses[0].part_of_speech, "exclamation");
        assert_eq!(entry.senses[0].definitions[0], "used as a greeting");
    }

    #[test]
    fn test_miss_prompt_falls_back_to_query() {
        let miss = ApiMiss::default();
        assert_eq!(miss.prompt("qwzx"), "No entry for `qwzx`");

        let miss = ApiMiss {
            message: Some("Sorry, we couldn't find that word.".to_string()),
        };
        assert_eq!(miss.prompt("qwzx"), "Sorry, we couldn't find that word.");
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let source = DictSource::new(&SourceConfig {
            endpoint: "https://dict.example.com/v1/".to_string(),
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(source.endpoint(), "https://dict.example.com/v1");
    }
}
