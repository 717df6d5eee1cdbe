pub mod bookings;
pub mod daycare;
pub mod health;
pub mod providers;

use crate::{
    error::{ApiError, ApiResult},
    models::{auth::AuthenticatedUser, user::UserRole},
};

pub(crate) fn require_role(user: &AuthenticatedUser, role: UserRole) -> ApiResult<()> {
    if user.role != role {
        return Err(ApiError::forbidden("Vous n'êtes pas autorisé à effectuer cette action."));
    }
    Ok(())
}
