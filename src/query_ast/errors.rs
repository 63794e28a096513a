#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum QueryBuilderError {
    #[error("invalid field: {0}")] InvalidField(String),
    #[error("invalid sort direction: {0}")] InvalidDirection(String),
    #[error("invalid limit or offset: {0}")] InvalidLimitOrOffset(String),
    #[error("{0} requires at least one operand")] EmptyBooleanCombinator(&'static str),
    #[error("unknown operation or operand: {0}")] UnknownOperationOrOperand(String),
    #[error("missing select fields")] MissingSelectFields,
    #[error("invalid identifier: {0}")] InvalidIdentifier(String),
    #[error("costs requested but no cost query generator is attached")] CostsUnavailable,
    #[error("parse error: {0}")] Parse(String),
}

impl From<serde_json::Error> for QueryBuilderError { fn from(e: serde_json::Error) -> Self { QueryBuilderError::Parse(e.to_string()) } }
