//! Narrative generation.
//!
//! A remote language model turns the patient record, lesion counts and
//! clinician grades into a free-text diagnostic opinion. The service is
//! optional and fallible: any failure yields a fixed placeholder text and
//! never fails the request.

mod client;
mod request;

pub use client::{
    generate_or_placeholder, parse_completion, ChatCompletionClient, Narrative, NarrativeConfig,
    NarrativeGenerator, DEFAULT_NARRATIVE_TIMEOUT, PLACEHOLDER_NARRATIVE,
};
pub use request::DiagnosisRequest;
