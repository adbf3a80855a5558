//! Diagnosis request fields and prompt construction.

use serde::{Deserialize, Deserializer};

use crate::quantify::{severity_text, LesionType};

/// Patient record, lesion counts and clinician grades for one narrative.
///
/// Every field is required. Grades are DR grade codes `"0"`..`"4"`; unknown
/// codes are rendered as "Unknown" rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiagnosisRequest {
    pub name: String,
    pub gender: String,
    #[serde(deserialize_with = "string_or_number")]
    pub age: String,
    pub occupation: String,
    #[serde(deserialize_with = "string_or_number")]
    pub contact: String,
    pub address: String,
    pub chief_complaint: String,
    pub present_illness: String,
    pub past_history: String,
    pub ma_count: u32,
    pub he_count: u32,
    pub ex_count: u32,
    pub se_count: u32,
    #[serde(deserialize_with = "string_or_number")]
    pub ma_severity: String,
    #[serde(deserialize_with = "string_or_number")]
    pub he_severity: String,
    #[serde(deserialize_with = "string_or_number")]
    pub ex_severity: String,
    #[serde(deserialize_with = "string_or_number")]
    pub se_severity: String,
    pub clinical_diagnosis: String,
    pub treatment_plan: String,
}

impl DiagnosisRequest {
    /// Count and grade code for a lesion class.
    pub fn lesion(&self, lesion: LesionType) -> (u32, &str) {
        match lesion {
            LesionType::EX => (self.ex_count, &self.ex_severity),
            LesionType::HE => (self.he_count, &self.he_severity),
            LesionType::MA => (self.ma_count, &self.ma_severity),
            LesionType::SE => (self.se_count, &self.se_severity),
        }
    }

    /// Build the instruction prompt sent to the language model.
    pub fn prompt(&self) -> String {
        let mut lesions = String::new();
        for lesion in [LesionType::MA, LesionType::HE, LesionType::EX, LesionType::SE] {
            let (count, grade) = self.lesion(lesion);
            lesions.push_str(&format!(
                "- {} ({}): {} found, severity: {}\n",
                lesion.label(),
                lesion.code(),
                count,
                severity_text(grade)
            ));
        }

        format!(
            "[Role]\n\
             You are the medical assistant of a diabetic retinopathy diagnosis platform. \
             You explain findings based on evidence-based medicine and do not replace professional medical advice.\n\
             \n\
             [Background]\n\
             Diabetic retinopathy involves four lesion types: microaneurysms (MA), hemorrhages (HE), \
             hard exudates (EX) and soft exudates (SE). The international clinical DR severity scale has five grades: \
             healthy, mild NPDR, moderate NPDR, severe NPDR and proliferative DR (PDR).\n\
             \n\
             [Task]\n\
             Write an AI-assisted diagnostic opinion from the patient information below.\n\
             \n\
             Patient:\n\
             - Name: {name}\n\
             - Gender: {gender}\n\
             - Age: {age}\n\
             - Occupation: {occupation}\n\
             - Contact: {contact}\n\
             - Address: {address}\n\
             Chief complaint: {chief_complaint}\n\
             Present illness: {present_illness}\n\
             Past history: {past_history}\n\
             Lesion assessment:\n\
             {lesions}\
             Clinical diagnosis: {clinical_diagnosis}\n\
             Treatment plan: {treatment_plan}\n\
             \n\
             [Output]\n\
             Plain text without formatting, in five paragraphs:\n\
             History summary: [chief complaint, present illness and past history]\n\
             Lesion assessment: [count and severity of each lesion type]\n\
             Diagnostic opinion: [AI-supported DR diagnostic opinion]\n\
             Treatment suggestions: [control targets, follow-up interval and interventions]\n\
             Notes: This response is based on public medical guidelines. The AI-assisted opinion is for reference only \
             and does not replace professional medical advice. Treatment should be individualized by the clinician. \
             [Do not modify these notes]",
            name = self.name,
            gender = self.gender,
            age = self.age,
            occupation = self.occupation,
            contact = self.contact,
            address = self.address,
            chief_complaint = self.chief_complaint,
            present_illness = self.present_illness,
            past_history = self.past_history,
            lesions = lesions,
            clinical_diagnosis = self.clinical_diagnosis,
            treatment_plan = self.treatment_plan,
        )
    }
}

/// Accept either a JSON string or a JSON number.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}
