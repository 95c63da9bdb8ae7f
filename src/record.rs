//! Typed model of a raw (and localized) exam record.
//!
//! ```text
//! ExamRecord
//!  └─ results[]            SubjectBlock   (_id = subject name)
//!      └─ questions[]      Question       (subject, chapter, marks, …)
//!          └─ question     QuestionBody
//!              └─ en       LocalizedContent
//!                  ├─ content       HTML
//!                  ├─ options[]     QuestionOption { identifier, content: HTML }
//!                  └─ explanation   HTML
//! ```
//!
//! Only the fields the pipeline reads or rewrites are typed. Each struct
//! flattens the remaining fields into `extra`, declared where they sit in the
//! source layout, so a localized record serialises with its keys in the
//! original order and every untouched value intact. Absent content is `None`,
//! never an error.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// One exam sitting: a list of subjects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamRecord {
    #[serde(default)]
    pub results: Vec<SubjectBlock>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// All questions of one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectBlock {
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single question with its metadata.
///
/// `subject`, `chapter`, `marks` and the other metadata stay in `extra`;
/// see [`Question::subject`] and [`Question::chapter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<QuestionBody>,
}

/// Per-language content blocks of a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub en: Option<LocalizedContent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The HTML-bearing part of a question in one language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizedContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<QuestionOption>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// One answer option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where inside a question an HTML slot lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    Question,
    Option(String),
    Explanation,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Question => f.write_str("question"),
            Location::Option(id) => write!(f, "option:{id}"),
            Location::Explanation => f.write_str("explanation"),
        }
    }
}

impl FromStr for Location {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "question" => Ok(Location::Question),
            "explanation" => Ok(Location::Explanation),
            other => other
                .strip_prefix("option:")
                .map(|id| Location::Option(id.to_string()))
                .ok_or_else(|| format!("unknown location '{other}'")),
        }
    }
}

impl Serialize for Location {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Location {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Identifies one HTML slot within a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSite {
    pub subject: String,
    pub chapter: String,
    pub question_index: usize,
    pub location: Location,
}

/// Structural fingerprint used to check raw/localized isomorphism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordShape {
    /// `(subject id, question count, slot count)` per subject, in order.
    pub subjects: Vec<(String, usize, usize)>,
}

impl Question {
    /// The question's own `subject` field, if it is a scalar.
    pub fn subject(&self) -> Option<String> {
        self.extra.get("subject").and_then(scalar_label)
    }

    /// The question's `chapter` field, if it is a scalar.
    pub fn chapter(&self) -> Option<String> {
        self.extra.get("chapter").and_then(scalar_label)
    }

    /// The English content block, or `None` for a question without content.
    pub fn content(&self) -> Option<&LocalizedContent> {
        self.question.as_ref().and_then(|q| q.en.as_ref())
    }

    fn content_mut(&mut self) -> Option<&mut LocalizedContent> {
        self.question.as_mut().and_then(|q| q.en.as_mut())
    }
}

fn scalar_label(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn option_location(index: usize, opt: &QuestionOption) -> Location {
    match opt.identifier.as_deref() {
        Some(id) if !id.is_empty() => Location::Option(id.to_string()),
        _ => Location::Option((index + 1).to_string()),
    }
}

fn site_for(block: &SubjectBlock, q: &Question, index: usize, location: Location) -> SlotSite {
    let subject = if block.id.is_empty() {
        q.subject().unwrap_or_default()
    } else {
        block.id.clone()
    };
    SlotSite {
        subject,
        chapter: q.chapter().unwrap_or_default(),
        question_index: index,
        location,
    }
}

impl ExamRecord {
    /// Parse a record from its JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialise the record the way localized files are written.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Every HTML slot in document order: question, options, explanation.
    ///
    /// Slots that are absent in the record are skipped.
    pub fn slots(&self) -> Vec<(SlotSite, &str)> {
        let mut out = Vec::new();
        for block in &self.results {
            for (qi, q) in block.questions.iter().enumerate() {
                let Some(c) = q.content() else { continue };
                if let Some(html) = c.content.as_deref() {
                    out.push((site_for(block, q, qi, Location::Question), html));
                }
                for (oi, opt) in c.options.iter().flatten().enumerate() {
                    if let Some(html) = opt.content.as_deref() {
                        out.push((site_for(block, q, qi, option_location(oi, opt)), html));
                    }
                }
                if let Some(html) = c.explanation.as_deref() {
                    out.push((site_for(block, q, qi, Location::Explanation), html));
                }
            }
        }
        out
    }

    /// Visit every HTML slot mutably, in the same order as [`Self::slots`].
    pub fn for_each_slot_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&SlotSite, &mut String),
    {
        for block in &mut self.results {
            let block_id = block.id.clone();
            for (qi, q) in block.questions.iter_mut().enumerate() {
                let subject = if block_id.is_empty() {
                    q.subject().unwrap_or_default()
                } else {
                    block_id.clone()
                };
                let chapter = q.chapter().unwrap_or_default();
                let site = |location| SlotSite {
                    subject: subject.clone(),
                    chapter: chapter.clone(),
                    question_index: qi,
                    location,
                };
                let Some(c) = q.content_mut() else { continue };
                if let Some(html) = c.content.as_mut() {
                    f(&site(Location::Question), html);
                }
                for (oi, opt) in c.options.iter_mut().flatten().enumerate() {
                    let location = option_location(oi, opt);
                    if let Some(html) = opt.content.as_mut() {
                        f(&site(location), html);
                    }
                }
                if let Some(html) = c.explanation.as_mut() {
                    f(&site(Location::Explanation), html);
                }
            }
        }
    }

    /// Structural fingerprint: subjects, question counts, slot counts.
    pub fn shape(&self) -> RecordShape {
        RecordShape {
            subjects: self
                .results
                .iter()
                .map(|b| {
                    let slots = b
                        .questions
                        .iter()
                        .filter_map(Question::content)
                        .map(|c| {
                            usize::from(c.content.is_some())
                                + c.options
                                    .iter()
                                    .flatten()
                                    .filter(|o| o.content.is_some())
                                    .count()
                                + usize::from(c.explanation.is_some())
                        })
                        .sum();
                    (b.id.clone(), b.questions.len(), slots)
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
  "results": [
    {
      "_id": "Physics",
      "questions": [
        {
          "subject": "Physics",
          "chapter": "Optics",
          "chapterGroup": "Waves",
          "marks": 4,
          "negMarks": 1,
          "difficulty": "easy",
          "isOutOfSyllabus": false,
          "question": {
            "en": {
              "content": "<p>Q1</p>",
              "options": [
                { "identifier": "A", "content": "<p>a</p>" },
                { "identifier": "B", "content": "<p>b</p>" }
              ],
              "correct_options": ["A"],
              "explanation": "<p>because</p>"
            }
          }
        },
        { "subject": "Physics", "chapter": 7 }
      ]
    }
  ]
}"#;

    #[test]
    fn slots_visit_in_document_order() {
        let rec = ExamRecord::from_json(SAMPLE).unwrap();
        let locs: Vec<String> = rec
            .slots()
            .iter()
            .map(|(s, _)| s.location.to_string())
            .collect();
        assert_eq!(locs, ["question", "option:A", "option:B", "explanation"]);
        let (site, html) = &rec.slots()[0];
        assert_eq!(site.subject, "Physics");
        assert_eq!(site.chapter, "Optics");
        assert_eq!(site.question_index, 0);
        assert_eq!(*html, "<p>Q1</p>");
    }

    #[test]
    fn question_without_content_is_typed_absence() {
        let rec = ExamRecord::from_json(SAMPLE).unwrap();
        let q = &rec.results[0].questions[1];
        assert!(q.content().is_none());
        assert_eq!(q.chapter().as_deref(), Some("7"));
    }

    #[test]
    fn roundtrip_preserves_keys_and_order() {
        let rec = ExamRecord::from_json(SAMPLE).unwrap();
        let out = rec.to_json_pretty().unwrap();
        let original: Value = serde_json::from_str(SAMPLE).unwrap();
        let written: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(original, written);
        assert_eq!(out, serde_json::to_string_pretty(&original).unwrap());
    }

    #[test]
    fn mutation_matches_read_order() {
        let mut rec = ExamRecord::from_json(SAMPLE).unwrap();
        let mut seen = Vec::new();
        rec.for_each_slot_mut(|site, html| {
            seen.push(site.location.clone());
            html.push('!');
        });
        let read: Vec<Location> = rec.slots().into_iter().map(|(s, _)| s.location).collect();
        assert_eq!(seen, read);
        assert!(rec.slots().iter().all(|(_, h)| h.ends_with('!')));
    }

    #[test]
    fn option_without_identifier_uses_position() {
        let rec = ExamRecord::from_json(
            r#"{"results":[{"_id":"M","questions":[{"question":{"en":{"options":[{"content":"x"}]}}}]}]}"#,
        )
        .unwrap();
        assert_eq!(rec.slots()[0].0.location, Location::Option("1".into()));
    }

    #[test]
    fn location_string_form() {
        for loc in [
            Location::Question,
            Location::Option("C".into()),
            Location::Explanation,
        ] {
            let s = loc.to_string();
            assert_eq!(s.parse::<Location>().unwrap(), loc);
        }
        assert!("footer".parse::<Location>().is_err());
    }

    #[test]
    fn shape_counts_subjects_questions_slots() {
        let rec = ExamRecord::from_json(SAMPLE).unwrap();
        assert_eq!(rec.shape().subjects, vec![("Physics".to_string(), 2, 4)]);
    }
}
