pub mod core;
pub mod export;
pub mod grades;
pub mod groups;
pub mod rankings;
pub mod settings;
pub mod stats;
pub mod users;
