//! User provisioning. Authentication itself lives upstream; this only keeps
//! the rows the engine needs for ownership checks and notification payloads.

use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{CreateUserRequest, User, UserRole};

pub struct UserService {
    pool: PgPool,
}

impl UserService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, req: &CreateUserRequest) -> Result<User, ServiceError> {
        let inserted = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, first_name, last_name, role)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&req.email)
        .bind(&req.first_name)
        .bind(&req.last_name)
        .bind(req.role.unwrap_or(UserRole::User))
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(user) => {
                info!("user {} created", user.id);
                Ok(user)
            }
            Err(e) if is_email_conflict(&e) => Err(ServiceError::InvalidInput {
                field: "email",
                message: "already registered".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, user_id: Uuid) -> Result<User, ServiceError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ServiceError::NotFound { resource: "user" })
    }
}

fn is_email_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.constraint() == Some("users_email_key"),
        _ => false,
    }
}
