// Questionnaire intake and AI responses.
// Generation never runs in the request path: submission enqueues a task for the worker.

pub mod ai_responses;
pub mod handlers;
pub mod questionnaires;
pub mod validation;
