use crate::errors::AppError;
use crate::models::questionnaire::{CreateQuestionnaire, UpdateQuestionnaire};

const MAX_SHORT_FIELD: usize = 255;
const MAX_JOB_DESCRIPTION: usize = 20_000;

pub fn validate_create(req: &CreateQuestionnaire) -> Result<(), AppError> {
    required_text("position", &req.position)?;
    required_text("industry", &req.industry)?;
    optional_text("location", req.location.as_deref(), MAX_SHORT_FIELD)?;
    optional_text(
        "job_description",
        req.job_description.as_deref(),
        MAX_JOB_DESCRIPTION,
    )
}

pub fn validate_update(req: &UpdateQuestionnaire) -> Result<(), AppError> {
    if let Some(position) = &req.position {
        required_text("position", position)?;
    }
    if let Some(industry) = &req.industry {
        required_text("industry", industry)?;
    }
    optional_text("location", req.location.as_deref(), MAX_SHORT_FIELD)?;
    optional_text(
        "job_description",
        req.job_description.as_deref(),
        MAX_JOB_DESCRIPTION,
    )
}

fn required_text(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} must not be empty")));
    }
    optional_text(field, Some(value), MAX_SHORT_FIELD)
}

fn optional_text(field: &str, value: Option<&str>, max: usize) -> Result<(), AppError> {
    match value {
        Some(v) if v.trim().chars().count() > max => Err(AppError::Validation(format!(
            "{field} must be at most {max} characters"
        ))),
        _ => Ok(()),
    }
}
