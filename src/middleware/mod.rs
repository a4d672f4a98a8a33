mod user;

pub use user::UserContext;
