// Prompts for CV generation.

use crate::models::questionnaire::QuestionnaireRow;

pub const CV_SYSTEM: &str = "You are an experienced career coach and CV writer. \
    You tailor CVs to the role, industry and seniority a candidate is targeting. \
    Respond with the CV text only, without preamble.";

/// Builds the user prompt from a submitted questionnaire.
pub fn build_cv_prompt(q: &QuestionnaireRow) -> String {
    let mut prompt = format!(
        "Write an optimized CV for a candidate applying for the position of {position} \
         in the {industry} industry.\n\n\
         Experience level: {experience} years\n\
         Target company size: {company_size}\n\
         Application timeline: {timeline}\n",
        position = q.position,
        industry = q.industry,
        experience = q.experience_level,
        company_size = q.company_size,
        timeline = q.application_timeline,
    );

    if let Some(location) = q.location.as_deref().filter(|l| !l.trim().is_empty()) {
        prompt.push_str(&format!("Preferred location: {location}\n"));
    }

    if let Some(jd) = q.job_description.as_deref().filter(|d| !d.trim().is_empty()) {
        prompt.push_str("\nJob description:\n");
        prompt.push_str(jd.trim());
        prompt.push('\n');
    }

    prompt.push_str(
        "\nHighlight the skills and achievements most relevant to this role \
         and use keywords an applicant tracking system would look for.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn questionnaire() -> QuestionnaireRow {
        QuestionnaireRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            position: "Data Engineer".to_string(),
            industry: "Finance".to_string(),
            experience_level: "3-5".to_string(),
            company_size: "enterprise".to_string(),
            location: None,
            application_timeline: "1-3 months".to_string(),
            job_description: Some("Build batch and streaming pipelines.".to_string()),
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_prompt_includes_questionnaire_fields() {
        let prompt = build_cv_prompt(&questionnaire());
        assert!(prompt.contains("Data Engineer"));
        assert!(prompt.contains("Finance industry"));
        assert!(prompt.contains("3-5 years"));
        assert!(prompt.contains("Build batch and streaming pipelines."));
        assert!(!prompt.contains("Preferred location"));
    }

    #[test]
    fn test_blank_job_description_omitted() {
        let mut q = questionnaire();
        q.job_description = Some("   ".to_string());
        q.location = Some("Remote".to_string());
        let prompt = build_cv_prompt(&q);
        assert!(!prompt.contains("Job description"));
        assert!(prompt.contains("Preferred location: Remote"));
    }
}
