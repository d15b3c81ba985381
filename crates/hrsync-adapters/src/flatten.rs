use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use hrsync_core::{
    ApplicationGroup, AttachmentGroup, CandidateRecord, EducationGroup, EmploymentGroup,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_RESUME_CONTENT_FIELD_ID: &str = "11138961008";

/// How employment titles and companies stay aligned when one side is blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmploymentAlignment {
    /// A blank side is kept as `""` so `titles[i]` and `companies[i]` share
    /// one employment entry.
    #[default]
    Padded,
    /// Blank values are dropped from each array independently.
    Sparse,
}

impl FromStr for EmploymentAlignment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "padded" => Ok(EmploymentAlignment::Padded),
            "sparse" => Ok(EmploymentAlignment::Sparse),
            other => Err(format!("unknown employment alignment: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlattenConfig {
    pub resume_content_field_id: String,
    pub employment_alignment: EmploymentAlignment,
}

impl Default for FlattenConfig {
    fn default() -> Self {
        Self {
            resume_content_field_id: DEFAULT_RESUME_CONTENT_FIELD_ID.to_string(),
            employment_alignment: EmploymentAlignment::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FlattenError {
    #[error("candidate payload is not a JSON object")]
    NotAnObject,
    #[error("candidate payload has no usable integer id")]
    MissingId,
    #[error("candidate payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Scalar that accepts strings, numbers, booleans, or null. Null becomes `""`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Text(String);

impl Text {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn trimmed(&self) -> &str {
        self.0.trim()
    }

    pub fn is_blank(&self) -> bool {
        self.trimmed().is_empty()
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Text {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(Text(match value {
            Value::Null => String::new(),
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => other.to_string(),
        }))
    }
}

/// Anything but an array becomes empty; elements that fail to decode are skipped.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

fn lenient_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawCandidate {
    pub id: Option<Value>,
    pub first_name: Text,
    pub last_name: Text,
    #[serde(deserialize_with = "lenient_list")]
    pub email_addresses: Vec<RawContact>,
    #[serde(deserialize_with = "lenient_list")]
    pub phone_numbers: Vec<RawContact>,
    #[serde(deserialize_with = "lenient_list")]
    pub addresses: Vec<RawContact>,
    #[serde(deserialize_with = "lenient_list")]
    pub attachments: Vec<RawAttachment>,
    #[serde(deserialize_with = "lenient_list")]
    pub employments: Vec<RawEmployment>,
    #[serde(deserialize_with = "lenient_list")]
    pub educations: Vec<RawEducation>,
    #[serde(deserialize_with = "lenient_list")]
    pub applications: Vec<RawApplication>,
    #[serde(deserialize_with = "lenient_map")]
    pub custom_fields: Map<String, Value>,
    pub created_at: Text,
    pub updated_at: Text,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawContact {
    pub value: Text,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawAttachment {
    #[serde(rename = "type")]
    pub kind: Text,
    pub url: Text,
    pub filename: Text,
    pub created_at: Text,
    pub updated_at: Text,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawEmployment {
    pub title: Text,
    pub company_name: Text,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawEducation {
    pub degree: Text,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawApplication {
    #[serde(deserialize_with = "lenient_list")]
    pub jobs: Vec<RawJob>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawJob {
    pub name: Text,
}

fn candidate_id(id: Option<&Value>) -> Option<i64> {
    match id? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_contact(contacts: &[RawContact]) -> String {
    contacts
        .first()
        .map(|c| c.value.to_string())
        .unwrap_or_default()
}

fn normalize_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_timestamp(candidate_id: i64, field: &'static str, text: &Text) -> Option<DateTime<Utc>> {
    if text.is_blank() {
        return None;
    }
    match DateTime::parse_from_rfc3339(text.trimmed()) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(err) => {
            warn!(candidate_id, field, value = text.trimmed(), error = %err, "unparsable timestamp");
            None
        }
    }
}

fn resume_attachments(attachments: &[RawAttachment]) -> AttachmentGroup {
    let mut group = AttachmentGroup::default();
    for attachment in attachments {
        if attachment.kind.trimmed() != "resume" {
            continue;
        }
        if attachment.url.is_blank() && attachment.filename.is_blank() {
            continue;
        }
        group.push(attachment.url.trimmed(), attachment.filename.trimmed());
    }
    group
}

fn employment_group(employments: &[RawEmployment], alignment: EmploymentAlignment) -> EmploymentGroup {
    let mut group = EmploymentGroup::default();
    for employment in employments {
        let title = employment.title.trimmed();
        let company = employment.company_name.trimmed();
        match alignment {
            EmploymentAlignment::Padded => {
                if title.is_empty() && company.is_empty() {
                    continue;
                }
                group.titles.push(title.to_string());
                group.companies.push(company.to_string());
            }
            EmploymentAlignment::Sparse => {
                if !title.is_empty() {
                    group.titles.push(title.to_string());
                }
                if !company.is_empty() {
                    group.companies.push(company.to_string());
                }
            }
        }
    }
    group
}

fn non_blank(values: impl Iterator<Item = Text>) -> Vec<String> {
    values
        .filter(|v| !v.is_blank())
        .map(|v| v.trimmed().to_string())
        .collect()
}

/// The `value` of the custom field whose `id` matches `field_id`, or `""`.
fn custom_field_value(custom_fields: &Map<String, Value>, field_id: &str) -> String {
    #[derive(Deserialize)]
    struct CustomField {
        #[serde(default)]
        id: Text,
        #[serde(default)]
        value: Text,
    }

    custom_fields
        .values()
        .filter_map(|field| CustomField::deserialize(field).ok())
        .find(|field| field.id.trimmed() == field_id)
        .map(|field| field.value.to_string())
        .unwrap_or_default()
}

/// Flatten one raw Harvest candidate payload.
pub fn flatten_candidate(
    raw: &Value,
    config: &FlattenConfig,
) -> Result<CandidateRecord, FlattenError> {
    if !raw.is_object() {
        return Err(FlattenError::NotAnObject);
    }
    let parsed = RawCandidate::deserialize(raw)?;
    let candidate_id = candidate_id(parsed.id.as_ref()).ok_or(FlattenError::MissingId)?;

    let first_name = parsed.first_name.to_string();
    let last_name = parsed.last_name.to_string();
    let full_name = normalize_spaces(&format!("{first_name} {last_name}"));

    let degrees = non_blank(parsed.educations.into_iter().map(|e| e.degree));
    let job_names = non_blank(
        parsed
            .applications
            .into_iter()
            .flat_map(|a| a.jobs)
            .map(|j| j.name),
    );

    Ok(CandidateRecord {
        candidate_id,
        email: first_contact(&parsed.email_addresses),
        phone: first_contact(&parsed.phone_numbers),
        address: first_contact(&parsed.addresses),
        first_name,
        last_name,
        full_name,
        attachments: resume_attachments(&parsed.attachments),
        employment: employment_group(&parsed.employments, config.employment_alignment),
        education: EducationGroup { degrees },
        applications: ApplicationGroup { job_names },
        resume_content: custom_field_value(&parsed.custom_fields, &config.resume_content_field_id),
        created_at: parse_timestamp(candidate_id, "created_at", &parsed.created_at),
        updated_at: parse_timestamp(candidate_id, "updated_at", &parsed.updated_at),
        raw: raw.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn flatten(raw: Value) -> CandidateRecord {
        flatten_candidate(&raw, &FlattenConfig::default()).expect("flatten")
    }

    #[test]
    fn resume_attachments_stay_aligned() {
        let record = flatten(json!({
            "id": 42,
            "attachments": [
                { "type": "resume", "url": "A", "filename": "a.pdf" },
                { "type": "cover_letter", "url": "X", "filename": "x.pdf" },
                { "type": "resume", "url": "B", "filename": "b.pdf" }
            ]
        }));
        assert_eq!(record.attachments.links(), ["A", "B"]);
        assert_eq!(record.attachments.filenames(), ["a.pdf", "b.pdf"]);
    }

    #[test]
    fn scalars_default_to_empty_and_stringify() {
        let record = flatten(json!({
            "id": "7",
            "first_name": "  Grace ",
            "last_name": null,
            "phone_numbers": [{ "value": 5551234 }],
            "email_addresses": "not-a-list"
        }));
        assert_eq!(record.candidate_id, 7);
        assert_eq!(record.first_name, "  Grace ");
        assert_eq!(record.last_name, "");
        assert_eq!(record.full_name, "Grace");
        assert_eq!(record.phone, "5551234");
        assert_eq!(record.email, "");
        assert_eq!(record.address, "");
        assert_eq!(record.created_at, None);
    }

    #[test]
    fn employment_padded_keeps_pairs() {
        let raw = json!({
            "id": 1,
            "employments": [
                { "title": "Engineer", "company_name": "Acme" },
                { "title": "", "company_name": "Globex" },
                { "title": "Advisor", "company_name": null },
                { "title": " ", "company_name": "" },
                "garbage"
            ]
        });
        let padded = flatten(raw.clone());
        assert_eq!(padded.employment.titles, ["Engineer", "", "Advisor"]);
        assert_eq!(padded.employment.companies, ["Acme", "Globex", ""]);

        let sparse = flatten_candidate(
            &raw,
            &FlattenConfig {
                employment_alignment: EmploymentAlignment::Sparse,
                ..FlattenConfig::default()
            },
        )
        .expect("flatten");
        assert_eq!(sparse.employment.titles, ["Engineer", "Advisor"]);
        assert_eq!(sparse.employment.companies, ["Acme", "Globex"]);
    }

    #[test]
    fn nested_groups_skip_blanks_and_bad_shapes() {
        let record = flatten(json!({
            "id": 3,
            "educations": [{ "degree": "BSc" }, { "degree": "" }, { "degree": null }],
            "applications": [
                { "jobs": [{ "name": "Backend" }, { "name": "  " }] },
                { "jobs": null },
                { "jobs": [{ "name": "Data" }] }
            ]
        }));
        assert_eq!(record.education.degrees, ["BSc"]);
        assert_eq!(record.applications.job_names, ["Backend", "Data"]);
    }

    #[test]
    fn custom_field_selected_by_id() {
        let record = flatten(json!({
            "id": 5,
            "custom_fields": {
                "other": { "id": 1, "value": "nope" },
                "resume_text": { "id": 11138961008u64, "value": "Ten years of Rust" },
                "plain": "value"
            }
        }));
        assert_eq!(record.resume_content, "Ten years of Rust");

        let missing = flatten(json!({ "id": 6, "custom_fields": null }));
        assert_eq!(missing.resume_content, "");
    }

    #[test]
    fn rejects_payloads_without_id() {
        let config = FlattenConfig::default();
        assert!(matches!(
            flatten_candidate(&json!([1, 2]), &config),
            Err(FlattenError::NotAnObject)
        ));
        assert!(matches!(
            flatten_candidate(&json!({ "first_name": "x" }), &config),
            Err(FlattenError::MissingId)
        ));
        assert!(matches!(
            flatten_candidate(&json!({ "id": "abc" }), &config),
            Err(FlattenError::MissingId)
        ));
    }

    #[test]
    fn timestamps_parse_as_utc() {
        let record = flatten(json!({
            "id": 9,
            "created_at": "2024-01-02T03:04:05.000Z",
            "updated_at": "2024-01-03T00:00:00+02:00"
        }));
        assert_eq!(
            record.created_at.map(|t| t.to_rfc3339()),
            Some("2024-01-02T03:04:05+00:00".to_string())
        );
        assert_eq!(
            record.updated_at.map(|t| t.to_rfc3339()),
            Some("2024-01-02T22:00:00+00:00".to_string())
        );
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unparsable_timestamp_is_logged_with_candidate_id() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let record = tracing::subscriber::with_default(subscriber, || {
            flatten(json!({
                "id": 41,
                "created_at": "last tuesday",
                "updated_at": "  "
            }))
        });

        assert_eq!(record.created_at, None);
        assert_eq!(record.updated_at, None);
        let logs = String::from_utf8(captured.0.lock().expect("lock").clone()).expect("utf8");
        assert!(logs.contains("unparsable timestamp"), "{logs}");
        assert!(logs.contains("candidate_id=41"), "{logs}");
        assert!(logs.contains("last tuesday"), "{logs}");
        assert!(!logs.contains("updated_at"), "{logs}");
    }
}
