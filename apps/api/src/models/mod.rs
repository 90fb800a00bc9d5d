pub mod ai_response;
pub mod questionnaire;
