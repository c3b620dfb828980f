//! The acting, authenticated user.

use parley_shared::models::Sender;
use parley_shared::types::{User, UserId};

/// Passed explicitly into every operation that acts on behalf of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: User,
}

impl Session {
    pub fn new(user: User) -> Self {
        Self { user }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }

    pub fn sender(&self) -> Sender {
        Sender::from(&self.user)
    }
}

impl From<User> for Session {
    fn from(user: User) -> Self {
        Self::new(user)
    }
}
