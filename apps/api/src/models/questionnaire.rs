use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExperienceLevel {
    #[serde(rename = "0-2")]
    Junior,
    #[serde(rename = "3-5")]
    Mid,
    #[serde(rename = "6+")]
    Senior,
}

impl ExperienceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperienceLevel::Junior => "0-2",
            ExperienceLevel::Mid => "3-5",
            ExperienceLevel::Senior => "6+",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompanySize {
    Startup,
    Small,
    Medium,
    Enterprise,
}

impl CompanySize {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompanySize::Startup => "startup",
            CompanySize::Small => "small",
            CompanySize::Medium => "medium",
            CompanySize::Enterprise => "enterprise",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApplicationTimeline {
    #[serde(rename = "immediate")]
    Immediate,
    #[serde(rename = "1-3 months")]
    OneToThreeMonths,
    #[serde(rename = "3-6 months")]
    ThreeToSixMonths,
    #[serde(rename = "6+ months")]
    SixPlusMonths,
}

impl ApplicationTimeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationTimeline::Immediate => "immediate",
            ApplicationTimeline::OneToThreeMonths => "1-3 months",
            ApplicationTimeline::ThreeToSixMonths => "3-6 months",
            ApplicationTimeline::SixPlusMonths => "6+ months",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct QuestionnaireRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub position: String,
    pub industry: String,
    pub experience_level: String,
    pub company_size: String,
    pub location: Option<String>,
    pub application_timeline: String,
    pub job_description: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Request body for submitting a questionnaire.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateQuestionnaire {
    pub user_id: Uuid,
    pub position: String,
    pub industry: String,
    pub experience_level: ExperienceLevel,
    pub company_size: CompanySize,
    pub location: Option<String>,
    pub application_timeline: ApplicationTimeline,
    pub job_description: Option<String>,
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateQuestionnaire {
    pub user_id: Uuid,
    pub position: Option<String>,
    pub industry: Option<String>,
    pub experience_level: Option<ExperienceLevel>,
    pub company_size: Option<CompanySize>,
    pub location: Option<String>,
    pub application_timeline: Option<ApplicationTimeline>,
    pub job_description: Option<String>,
}
