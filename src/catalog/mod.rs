//! Project and test-case catalogs.
//!
//! Both are plain CRUD over SQLite with reads served through a
//! [`CacheAsideCollection`](crate::cache::CacheAsideCollection). Every write
//! invalidates before it returns.

pub mod projects;
pub mod test_cases;

pub use self::projects::{NewProject, Project, ProjectCatalog, ProjectStatus, ProjectUpdate};
pub use self::test_cases::{
    NewTestCase, Priority, TestCase, TestCaseCatalog, TestCaseStatus, TestCaseUpdate,
};

use crate::error::{CoreError, Result};

pub(crate) fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(format!("{field} is required")));
    }
    Ok(())
}
