use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

pub const DEFAULT_STATUS_KEY: &str = "opcsv-enum";
pub const IP_FIELD: &str = "IP";
pub const SHODAN_HOST_URL: &str = "https://shodan.io/host/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("missing field `{field}`")]
    MissingField { field: String },
    #[error("malformed row: {reason}")]
    MalformedRow { reason: String },
}

/// One CSV record as an ordered column -> value mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    fields: Vec<(String, String)>,
}

impl Row {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Replaces the value of `name`, appending the column when it is absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(key, _)| key == name) {
            Some(entry) => entry.1 = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(key, _)| key.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

impl Serialize for Row {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    New,
    Triaged,
    Flagged,
    Ok,
}

impl Default for StatusCode {
    fn default() -> Self {
        Self::New
    }
}

impl StatusCode {
    pub const ALL: [StatusCode; 4] = [
        StatusCode::New,
        StatusCode::Triaged,
        StatusCode::Flagged,
        StatusCode::Ok,
    ];

    pub fn code(&self) -> u8 {
        match self {
            StatusCode::New => 0,
            StatusCode::Triaged => 1,
            StatusCode::Flagged => 2,
            StatusCode::Ok => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(StatusCode::New),
            1 => Some(StatusCode::Triaged),
            2 => Some(StatusCode::Flagged),
            3 => Some(StatusCode::Ok),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StatusCode::New => "NEW",
            StatusCode::Triaged => "TRIAGED",
            StatusCode::Flagged => "FLAGGED",
            StatusCode::Ok => "OK",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for StatusCode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim();
        if let Ok(code) = normalized.parse::<i64>() {
            return Self::from_code(code).ok_or_else(|| format!("Unknown status code: {code}"));
        }
        match normalized.to_lowercase().as_str() {
            "new" => Ok(StatusCode::New),
            "triaged" => Ok(StatusCode::Triaged),
            "flagged" => Ok(StatusCode::Flagged),
            "ok" => Ok(StatusCode::Ok),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub name: String,
    pub format: String,
    pub is_markup: bool,
}

impl Annotation {
    pub fn text(name: &str, format: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            format: format.into(),
            is_markup: false,
        }
    }

    pub fn markup(name: &str, format: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            format: format.into(),
            is_markup: true,
        }
    }
}

/// The status column of a derived file and the classifier over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusKey {
    name: String,
}

impl Default for StatusKey {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_KEY)
    }
}

impl StatusKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_code(&self) -> StatusCode {
        StatusCode::New
    }

    pub fn default_row(&self) -> Row {
        self.row_for(self.default_code())
    }

    pub fn row_for(&self, status: StatusCode) -> Row {
        Row::from_pairs([(self.name.clone(), status.code().to_string())])
    }

    pub fn status_of(&self, derived: &Row) -> Result<StatusCode, ClassifyError> {
        let raw = derived
            .get(&self.name)
            .ok_or_else(|| ClassifyError::MissingField {
                field: self.name.clone(),
            })?;
        let code = raw
            .trim()
            .parse::<i64>()
            .map_err(|_| ClassifyError::MalformedRow {
                reason: format!("status `{raw}` is not an integer"),
            })?;
        StatusCode::from_code(code).ok_or_else(|| ClassifyError::MalformedRow {
            reason: format!("status code {code} is out of range"),
        })
    }

    pub fn classify(&self, derived: &Row, source: &Row) -> Result<Vec<Annotation>, ClassifyError> {
        let status = self.status_of(derived)?;
        let ip = source
            .get(IP_FIELD)
            .ok_or_else(|| ClassifyError::MissingField {
                field: IP_FIELD.to_string(),
            })?;
        Ok(vec![
            Annotation::text("Status", status.label()),
            Annotation::markup("Shodan", shodan_link(ip)),
        ])
    }
}

/// Lookup link for `ip`. The address is percent-encoded as a single path
/// segment and the whole URL is attribute-escaped, so row content cannot
/// leave the `href`.
pub fn shodan_link(ip: &str) -> String {
    let href = match Url::parse(SHODAN_HOST_URL) {
        Ok(mut url) => {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().push(ip);
            }
            url.to_string()
        }
        Err(_) => format!("{SHODAN_HOST_URL}{ip}"),
    };
    format!("<a target='_blank' href='{}'>Click</a>", escape_html(&href))
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(ip: &str) -> Row {
        Row::from_pairs([("IP", ip), ("Port", "22")])
    }

    #[test]
    fn classify_produces_status_and_shodan_annotations() {
        let key = StatusKey::default();
        let annotations = key
            .classify(&key.default_row(), &host("1.2.3.4"))
            .expect("classify");

        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0], Annotation::text("Status", "NEW"));
        assert_eq!(annotations[1].name, "Shodan");
        assert!(annotations[1].is_markup);
        assert!(annotations[1]
            .format
            .contains("https://shodan.io/host/1.2.3.4"));
    }

    #[test]
    fn hostile_ip_cannot_break_out_of_the_link() {
        let link = shodan_link("1.2.3.4'><script>alert(1)</script><a href='");

        assert!(!link.contains("<script>"), "{link}");
        assert_eq!(link.matches("'>").count(), 1, "{link}");
        assert!(link.starts_with("<a target='_blank' href='https://shodan.io/host/1.2.3.4"));
        assert!(link.ends_with("'>Click</a>"));
        assert_eq!(link.matches('<').count(), 2);
    }

    #[test]
    fn plain_ip_link_is_unchanged() {
        assert_eq!(
            shodan_link("5.6.7.8"),
            "<a target='_blank' href='https://shodan.io/host/5.6.7.8'>Click</a>"
        );
    }

    #[test]
    fn escape_html_covers_markup_characters() {
        assert_eq!(
            escape_html("<a href=\"x\">'&'</a>"),
            "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn every_valid_code_has_a_non_empty_fixed_label() {
        let key = StatusKey::default();
        let labels = ["NEW", "TRIAGED", "FLAGGED", "OK"];
        for code in 0..=3 {
            let derived = Row::from_pairs([(DEFAULT_STATUS_KEY, code.to_string())]);
            let annotations = key.classify(&derived, &host("10.0.0.1")).expect("classify");
            let label = &annotations[0].format;
            assert!(!label.is_empty());
            assert!(labels.contains(&label.as_str()), "unexpected label {label}");
        }
    }

    #[test]
    fn missing_ip_is_reported_not_panicked() {
        let key = StatusKey::default();
        let source = Row::from_pairs([("Host", "example.org")]);
        let err = key
            .classify(&key.default_row(), &source)
            .expect_err("missing ip");
        assert_eq!(
            err,
            ClassifyError::MissingField {
                field: "IP".to_string()
            }
        );
    }

    #[test]
    fn non_integer_and_out_of_range_codes_are_malformed() {
        let key = StatusKey::default();
        for raw in ["abc", "", "7", "-1"] {
            let derived = Row::from_pairs([(DEFAULT_STATUS_KEY, raw)]);
            let err = key
                .classify(&derived, &host("1.1.1.1"))
                .expect_err("malformed");
            assert!(matches!(err, ClassifyError::MalformedRow { .. }), "{raw}");
        }
    }

    #[test]
    fn missing_status_column_is_missing_field() {
        let key = StatusKey::new("triage");
        let derived = Row::from_pairs([(DEFAULT_STATUS_KEY, "0")]);
        let err = key
            .classify(&derived, &host("1.1.1.1"))
            .expect_err("wrong column");
        assert_eq!(
            err,
            ClassifyError::MissingField {
                field: "triage".to_string()
            }
        );
    }

    #[test]
    fn status_code_parses_numbers_and_names() {
        assert_eq!("2".parse::<StatusCode>(), Ok(StatusCode::Flagged));
        assert_eq!(" ok ".parse::<StatusCode>(), Ok(StatusCode::Ok));
        assert!("9".parse::<StatusCode>().is_err());
        assert!("later".parse::<StatusCode>().is_err());
    }

    #[test]
    fn row_set_replaces_in_place_and_serializes_in_order() {
        let mut row = Row::from_pairs([("b", "1"), ("a", "2")]);
        row.set("b", "3");
        row.set("c", "4");
        assert_eq!(row.get("b"), Some("3"));
        assert_eq!(row.field_names().collect::<Vec<_>>(), vec!["b", "a", "c"]);

        let json = serde_json::to_string(&row).expect("serialize");
        assert_eq!(json, r#"{"b":"3","a":"2","c":"4"}"#);
    }
}
