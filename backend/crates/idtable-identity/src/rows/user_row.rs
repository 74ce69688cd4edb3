use idtable_commons::{User, UserId};
use idtable_store::TableRow;

use super::columns::*;
use super::{optional_str, required_str, RowMapping};
use crate::error::Result;

/// Entity row of a user aggregate.
pub struct UserRow;

impl RowMapping for User {
    fn write_columns(&self, row: &mut TableRow) {
        row.set(ID, self.id.as_str());
        row.set(USER_NAME, self.user_name.as_str());
        row.set(NORMALIZED_USER_NAME, self.normalized_user_name.as_str());
        row.set_opt(EMAIL, self.email.as_deref());
        row.set_opt(NORMALIZED_EMAIL, self.normalized_email.as_deref());
        row.set(EMAIL_CONFIRMED, self.email_confirmed);
        row.set_opt(PASSWORD_HASH, self.password_hash.as_deref());
        row.set_opt(SECURITY_STAMP, self.security_stamp.as_deref());
        row.set_opt(CONCURRENCY_STAMP, self.concurrency_stamp.as_deref());
        row.set_opt(PHONE_NUMBER, self.phone_number.as_deref());
        row.set(PHONE_NUMBER_CONFIRMED, self.phone_number_confirmed);
        row.set(TWO_FACTOR_ENABLED, self.two_factor_enabled);
        row.set_opt(
            LOCKOUT_END,
            self.lockout_end.map(idtable_store::Property::DateTime),
        );
        row.set(LOCKOUT_ENABLED, self.lockout_enabled);
        row.set(ACCESS_FAILED_COUNT, self.access_failed_count);
        row.set(CREATED_AT, idtable_store::Property::DateTime(self.created_at));
        row.set(UPDATED_AT, idtable_store::Property::DateTime(self.updated_at));
    }

    fn read_columns(row: &TableRow) -> Result<Self> {
        Ok(User {
            id: UserId::new(required_str(row, ID)?),
            user_name: required_str(row, USER_NAME)?,
            normalized_user_name: required_str(row, NORMALIZED_USER_NAME)?,
            email: optional_str(row, EMAIL),
            normalized_email: optional_str(row, NORMALIZED_EMAIL),
            email_confirmed: row.get_bool(EMAIL_CONFIRMED).unwrap_or(false),
            password_hash: optional_str(row, PASSWORD_HASH),
            security_stamp: optional_str(row, SECURITY_STAMP),
            concurrency_stamp: optional_str(row, CONCURRENCY_STAMP),
            phone_number: optional_str(row, PHONE_NUMBER),
            phone_number_confirmed: row.get_bool(PHONE_NUMBER_CONFIRMED).unwrap_or(false),
            two_factor_enabled: row.get_bool(TWO_FACTOR_ENABLED).unwrap_or(false),
            lockout_end: row.get_i64(LOCKOUT_END),
            lockout_enabled: row.get_bool(LOCKOUT_ENABLED).unwrap_or(false),
            access_failed_count: row.get_i32(ACCESS_FAILED_COUNT).unwrap_or(0),
            created_at: row.get_i64(CREATED_AT).unwrap_or(0),
            updated_at: row.get_i64(UPDATED_AT).unwrap_or(0),
            etag: row.etag.as_ref().map(|e| e.as_str().to_string()),
        })
    }
}

impl UserRow {
    /// Whether `row` is the entity row of its partition.
    pub fn is_entity_row(row: &TableRow) -> bool {
        row.partition_key == row.row_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_helper::KeyVersion;
    use crate::rows::key_version_of;

    #[test]
    fn test_user_row_mapping() {
        let mut user = User::new("alice").with_email("a@x.com");
        user.lockout_end = Some(1_700_000_000_000);
        user.access_failed_count = 2;

        let row = user.to_row("N_1", "N_1", KeyVersion::Current);
        assert_eq!(row.get_str(USER_NAME), Some("alice"));
        assert_eq!(row.get_str(NORMALIZED_EMAIL), Some("A@X.COM"));
        assert_eq!(key_version_of(&row), KeyVersion::Current);
        assert!(row.get(PHONE_NUMBER).is_none());
        assert!(UserRow::is_entity_row(&row));

        let back = User::read_columns(&row).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn test_missing_required_column() {
        let row = TableRow::new("N_1", "N_1").with(ID, "u1");
        assert!(User::read_columns(&row).is_err());
    }
}
