//! Record collection constants.

/// Lexicon NSID for idea records.
pub const IDEA_COLLECTION: &str = "app.ideaboard.idea";

/// Lexicon NSID for Bluesky profile records, read for display names.
pub const PROFILE_COLLECTION: &str = "app.bsky.actor.profile";

/// The singleton key for the profile record.
pub const PROFILE_KEY: &str = "self";
