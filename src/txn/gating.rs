//! Command gating
//!
//! Small, stable allow-lists deciding which commands may run inside a
//! multi-document transaction, which databases admit them, and which
//! commands may touch a prepared transaction.

use ahash::AHashSet;
use once_cell::sync::Lazy;

use crate::config;
use crate::{Result, TxnError};

/// Commands allowed in a multi-document transaction
static TXN_COMMAND_ALLOW_LIST: Lazy<AHashSet<&'static str>> = Lazy::new(|| {
    [
        "abortTransaction",
        "aggregate",
        "commitTransaction",
        "coordinateCommitTransaction",
        "delete",
        "distinct",
        "doTxn",
        "find",
        "findandmodify",
        "findAndModify",
        "geoSearch",
        "getMore",
        "insert",
        "killCursors",
        "prepareTransaction",
        "update",
        "voteAbortTransaction",
        "voteCommitTransaction",
    ]
    .into_iter()
    .collect()
});

/// Commands additionally allowed when test commands are enabled
static TXN_COMMAND_TEST_ALLOW_LIST: Lazy<AHashSet<&'static str>> =
    Lazy::new(|| ["dbHash"].into_iter().collect());

/// Commands that may run against the `admin` database in a transaction
static TXN_ADMIN_COMMANDS: Lazy<AHashSet<&'static str>> = Lazy::new(|| {
    [
        "abortTransaction",
        "commitTransaction",
        "coordinateCommitTransaction",
        "doTxn",
        "prepareTransaction",
        "voteAbortTransaction",
        "voteCommitTransaction",
    ]
    .into_iter()
    .collect()
});

/// Commands that may run against a prepared transaction
static PREPARED_TXN_COMMAND_ALLOW_LIST: Lazy<AHashSet<&'static str>> = Lazy::new(|| {
    ["abortTransaction", "commitTransaction", "prepareTransaction"]
        .into_iter()
        .collect()
});

/// Check whether `cmd_name` against `db_name` may run inside a
/// multi-document transaction at all.
pub fn check_command_allowed(db_name: &str, cmd_name: &str) -> Result<()> {
    if cmd_name == "count" {
        return Err(TxnError::OperationNotSupportedInTransaction(
            "cannot run 'count' in a multi-document transaction; use an aggregation with \
             $count instead"
                .to_string(),
        ));
    }

    let allowed = TXN_COMMAND_ALLOW_LIST.contains(cmd_name)
        || (config::test_commands_enabled() && TXN_COMMAND_TEST_ALLOW_LIST.contains(cmd_name));
    if !allowed {
        return Err(TxnError::OperationNotSupportedInTransaction(format!(
            "cannot run '{}' in a multi-document transaction",
            cmd_name
        )));
    }

    if db_name == "config"
        || db_name == "local"
        || (db_name == "admin" && !TXN_ADMIN_COMMANDS.contains(cmd_name))
    {
        return Err(TxnError::OperationNotSupportedInTransaction(format!(
            "cannot run command against the '{}' database in a transaction",
            db_name
        )));
    }

    Ok(())
}

/// Whether `cmd_name` may run while the transaction is prepared
pub fn is_command_allowed_on_prepared(cmd_name: &str) -> bool {
    PREPARED_TXN_COMMAND_ALLOW_LIST.contains(cmd_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_is_rejected_with_pointer() {
        let err = check_command_allowed("test", "count").unwrap_err();
        match err {
            TxnError::OperationNotSupportedInTransaction(msg) => {
                assert!(msg.contains("$count"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_crud_commands_are_allowed() {
        for cmd in ["insert", "update", "delete", "find", "aggregate"] {
            check_command_allowed("test", cmd).unwrap();
        }
    }

    #[test]
    fn test_unlisted_command_is_rejected() {
        assert!(check_command_allowed("test", "createIndexes").is_err());
        assert!(check_command_allowed("test", "drop").is_err());
    }

    #[test]
    fn test_internal_databases_are_rejected() {
        assert!(check_command_allowed("config", "find").is_err());
        assert!(check_command_allowed("local", "find").is_err());
        assert!(check_command_allowed("admin", "find").is_err());
        // Designated admin commands pass.
        check_command_allowed("admin", "commitTransaction").unwrap();
        check_command_allowed("admin", "prepareTransaction").unwrap();
    }

    #[test]
    fn test_test_only_command_requires_flag() {
        assert!(check_command_allowed("test", "dbHash").is_err());
        config::set_test_commands_enabled(true);
        check_command_allowed("test", "dbHash").unwrap();
        config::set_test_commands_enabled(false);
    }

    #[test]
    fn test_prepared_allow_list() {
        assert!(is_command_allowed_on_prepared("commitTransaction"));
        assert!(is_command_allowed_on_prepared("abortTransaction"));
        assert!(is_command_allowed_on_prepared("prepareTransaction"));
        assert!(!is_command_allowed_on_prepared("insert"));
        assert!(!is_command_allowed_on_prepared("find"));
    }
}
