//! Query-side analysis: structured-selector detection and intent
//! classification.

mod filters;
mod intent;

pub use filters::{build_enhanced_query, extract_filters};
pub use intent::{Intent, IntentClassifier};
