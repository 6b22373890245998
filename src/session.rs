//! Session key constants shared by the auth shim and the chat handlers.

pub const USER_ID: &str = "user_id";
