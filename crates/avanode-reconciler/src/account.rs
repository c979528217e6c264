//! Service account the node process runs as.

use std::time::Duration;

use avanode_store::{Ownership, StoreError};
use avanode_supervisor::run_checked;
use tracing::info;

use crate::error::{DriverError, InstallError};

const USERADD: &str = "useradd";
const NOLOGIN_SHELL: &str = "/usr/sbin/nologin";
const ACCOUNT_TIMEOUT: Duration = Duration::from_secs(30);

/// Arguments creating a locked system account without a home directory
pub fn useradd_args(name: &str) -> Vec<&str> {
    vec!["--system", "--no-create-home", "--shell", NOLOGIN_SHELL, name]
}

/// Resolve `name` to a uid/gid pair, creating the account when `create` is set.
pub async fn service_owner(name: &str, create: bool) -> Result<Ownership, DriverError> {
    match Ownership::for_user(name) {
        Ok(owner) => Ok(owner),
        Err(StoreError::UnknownUser(_)) if create => {
            info!("Creating system account {}", name);
            run_checked(USERADD, &useradd_args(name), Some(ACCOUNT_TIMEOUT))
                .await
                .map_err(InstallError::from)?;
            Ok(Ownership::for_user(name)?)
        }
        Err(StoreError::UnknownUser(_)) => Err(DriverError::Precondition(format!(
            "service account `{}` does not exist; run install first",
            name
        ))),
        Err(e) => Err(e.into()),
    }
}
