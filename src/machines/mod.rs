// Concrete actor types served by the bundled server

pub mod session;

pub use session::{session_machine, SessionServices, SuggestionPrompt, SESSION_ACTOR_TYPE};
