use tracing::{error, info};

use super::TodoController;
use crate::backend::{RemoteError, SignUpOutcome};
use crate::notice::{Action, Notice};
use crate::session::User;

impl TodoController {
    /// Sign in and follow the resulting session change, which loads the list
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<User, RemoteError> {
        let email = email.trim();
        match self.backends.auth.sign_in_with_password(email, password).await {
            Ok(session) => {
                info!(user = %session.user.id, "signed in");
                self.notify(Notice::success(format!("Signed in as {email}")));
                self.pump_session_events().await;
                Ok(session.user)
            }
            Err(e) => {
                self.pump_session_events().await;
                Err(self.account_failed(Action::SignIn, e))
            }
        }
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome, RemoteError> {
        let email = email.trim();
        match self.backends.auth.sign_up(email, password).await {
            Ok(outcome) => {
                let message = match &outcome {
                    SignUpOutcome::SignedIn(_) => format!("Account created, signed in as {email}"),
                    SignUpOutcome::ConfirmationSent => {
                        format!("Check {email} for a confirmation link")
                    }
                };
                info!(confirmation = matches!(outcome, SignUpOutcome::ConfirmationSent), "signed up");
                self.notify(Notice::success(message));
                self.pump_session_events().await;
                Ok(outcome)
            }
            Err(e) => {
                self.pump_session_events().await;
                Err(self.account_failed(Action::SignUp, e))
            }
        }
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<(), RemoteError> {
        let email = email.trim();
        match self.backends.auth.request_password_reset(email).await {
            Ok(()) => {
                self.notify(Notice::info(format!(
                    "If an account exists for {email}, a reset link is on its way"
                )));
                Ok(())
            }
            Err(e) => Err(self.account_failed(Action::ResetPassword, e)),
        }
    }

    /// Sign out. Session events are followed even when the request fails.
    pub async fn sign_out(&self) -> Result<(), RemoteError> {
        let result = self.backends.auth.sign_out().await;
        self.pump_session_events().await;
        match result {
            Ok(()) => {
                self.notify(Notice::success("Signed out"));
                Ok(())
            }
            Err(e) => Err(self.account_failed(Action::SignOut, e)),
        }
    }

    fn account_failed(&self, action: Action, e: RemoteError) -> RemoteError {
        error!(action = %action, error = %e, "account request failed");
        self.notify(Notice::action_failed(action, &e));
        e
    }
}
