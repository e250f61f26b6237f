use sqlx::error::{DatabaseError, ErrorKind};
use sqlx::postgres::PgDatabaseError;

use super::{
    ConstraintKind, StoreError, DRIVER_HAS_ACTIVE_RIDE, PAYMENT_EXISTS, RIDER_HAS_ACTIVE_RIDE,
};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound {
                entity: "record",
                id: String::new(),
            },
            sqlx::Error::Database(db) => translate_database_error(db.as_ref()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

fn translate_database_error(db: &dyn DatabaseError) -> StoreError {
    let table = db.table().unwrap_or_default();
    let constraint = db.constraint().unwrap_or_default();
    let column = db
        .try_downcast_ref::<PgDatabaseError>()
        .and_then(PgDatabaseError::column)
        .unwrap_or_default();

    match constraint {
        "rides_one_active_per_rider" => {
            return StoreError::Conflict(RIDER_HAS_ACTIVE_RIDE.to_string());
        }
        "rides_one_active_per_driver" => {
            return StoreError::Conflict(DRIVER_HAS_ACTIVE_RIDE.to_string());
        }
        "payments_one_open_per_ride" => {
            return StoreError::Conflict(PAYMENT_EXISTS.to_string());
        }
        "drivers_user_id_key" => {
            return StoreError::Conflict("driver profile already exists".to_string());
        }
        _ => {}
    }

    let kind = match db.kind() {
        ErrorKind::UniqueViolation => ConstraintKind::Unique,
        ErrorKind::ForeignKeyViolation => ConstraintKind::ForeignKey,
        ErrorKind::NotNullViolation => ConstraintKind::NotNull,
        ErrorKind::CheckViolation => ConstraintKind::Check,
        _ => {
            let detail = db.message();
            tracing::debug!(%table, %constraint, %detail, "unclassified database error");
            return StoreError::Database(detail.to_string());
        }
    };

    let column = match kind {
        ConstraintKind::Unique if column.is_empty() => unique_column(constraint),
        _ => column,
    };

    StoreError::Constraint {
        kind,
        message: constraint_message(kind, table, column),
    }
}

/// Caller-facing message for a constraint failure, phrased in terms of the
/// entity and field rather than schema object names.
pub fn constraint_message(kind: ConstraintKind, table: &str, column: &str) -> String {
    let entity = entity_name(table, column);
    match kind {
        ConstraintKind::ForeignKey => format!("The referenced {entity} does not exist"),
        ConstraintKind::Unique => {
            let field = humanize(column);
            if field.is_empty() || column.ends_with("_id") {
                format!("A {} with this identifier already exists", entity_name(table, ""))
            } else {
                format!("A {} with this {field} already exists", entity_name(table, ""))
            }
        }
        ConstraintKind::NotNull => {
            let field = humanize(column);
            if field.is_empty() {
                "The field is required".to_string()
            } else {
                format!("The {field} is required")
            }
        }
        ConstraintKind::Check => {
            let field = humanize(column);
            if field.is_empty() {
                "One or more values do not meet required conditions".to_string()
            } else {
                format!("The {field} value does not meet required conditions")
            }
        }
    }
}

/// `driver_id` names a Driver, otherwise the singular of the table.
pub fn entity_name(table: &str, column: &str) -> String {
    if let Some(entity) = column.to_ascii_lowercase().strip_suffix("_id") {
        if !entity.is_empty() {
            return humanize(entity);
        }
    }
    if table.is_empty() {
        return "Record".to_string();
    }
    humanize(table.strip_suffix('s').unwrap_or(table))
}

/// `pickup_address` becomes `Pickup Address`.
pub fn humanize(text: &str) -> String {
    text.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Column named by a `<table>_<column>_key` style unique constraint.
fn unique_column(constraint: &str) -> &str {
    constraint
        .strip_suffix("_key")
        .and_then(|rest| rest.rsplit('_').next())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanize_title_cases_snake_case() {
        assert_eq!(humanize("pickup_address"), "Pickup Address");
        assert_eq!(humanize(""), "");
    }

    #[test]
    fn entity_prefers_id_column_over_table() {
        assert_eq!(entity_name("rides", "driver_id"), "Driver");
        assert_eq!(entity_name("rides", "fare"), "Ride");
        assert_eq!(entity_name("", ""), "Record");
    }

    #[test]
    fn messages_name_entities_not_schema_objects() {
        assert_eq!(
            constraint_message(ConstraintKind::Unique, "rides", ""),
            "A Ride with this identifier already exists"
        );
        assert_eq!(
            constraint_message(ConstraintKind::ForeignKey, "rides", "driver_id"),
            "The referenced Driver does not exist"
        );
        assert_eq!(
            constraint_message(ConstraintKind::NotNull, "rides", "pickup_address"),
            "The Pickup Address is required"
        );
        assert_eq!(
            constraint_message(ConstraintKind::Check, "rides", "rating"),
            "The Rating value does not meet required conditions"
        );
        assert_eq!(
            constraint_message(ConstraintKind::Unique, "users", "phone"),
            "A User with this Phone already exists"
        );
    }

    #[test]
    fn unique_column_is_read_from_constraint_name() {
        assert_eq!(unique_column("users_phone_key"), "phone");
        assert_eq!(unique_column("weird"), "");
    }
}
