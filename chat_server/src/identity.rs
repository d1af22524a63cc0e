//! Identity directory: turns credentials into users.
//!
//! The gateway only sees the [`IdentityDirectory`] trait. [`SqliteDirectory`]
//! is the bundled implementation, storing argon2 hashes next to the public
//! profile and issuing HS256 bearer tokens.

use crate::auth::{self, TokenKeys};
use crate::db::{self, Pool};
use crate::error::{ChatError, Result};
use chat_protocol::User;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

pub const DEFAULT_PIC: &str =
    "https://icon-library.com/images/anonymous-avatar-icon/anonymous-avatar-icon-25.jpg";

/// Fields required to register a user.
#[derive(Clone)]
pub struct NewUser {
    pub user_name: String,
    pub email: String,
    pub password: String,
    pub pic: Option<String>,
}

impl std::fmt::Debug for NewUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewUser")
            .field("user_name", &self.user_name)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resolves credentials and looks users up. Calls may block.
pub trait IdentityDirectory: Send + Sync + 'static {
    /// Resolve a bearer token into the user it was issued for.
    fn verify_credential(&self, token: &str) -> Result<Option<User>>;
    fn find_by_id(&self, id: &Uuid) -> Result<Option<User>>;
    /// Case-insensitive substring match on name or email.
    fn find_matching(&self, needle: &str) -> Result<Vec<User>>;
    /// Create a user. Fails with `Conflict` when the email is taken.
    fn register(&self, new: NewUser) -> Result<User>;
    /// Check an email/password pair.
    fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>>;
    fn issue_token(&self, user: &User) -> Result<String>;
}

/// SQLite backed directory sharing the application pool.
#[derive(Clone, Debug)]
pub struct SqliteDirectory {
    pool: Pool,
    keys: TokenKeys,
}

impl SqliteDirectory {
    pub fn new(pool: Pool, keys: TokenKeys) -> Self {
        Self { pool, keys }
    }
}

impl IdentityDirectory for SqliteDirectory {
    fn verify_credential(&self, token: &str) -> Result<Option<User>> {
        let claims = match self.keys.verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!(error = %e, "rejected bearer token");
                return Ok(None);
            }
        };
        let Ok(id) = Uuid::parse_str(&claims.sub) else {
            return Ok(None);
        };
        self.find_by_id(&id)
    }

    fn find_by_id(&self, id: &Uuid) -> Result<Option<User>> {
        let conn = self.pool.get()?;
        get_user(&conn, id)
    }

    fn find_matching(&self, needle: &str) -> Result<Vec<User>> {
        let conn = self.pool.get()?;
        search_users(&conn, needle)
    }

    fn register(&self, new: NewUser) -> Result<User> {
        let hash = auth::hash_password(&new.password)
            .map_err(|e| ChatError::Internal(e.to_string()))?;
        let conn = self.pool.get()?;
        insert_user(&conn, &new, &hash)
    }

    fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>> {
        let conn = self.pool.get()?;
        let Some((user, hash)) = get_user_by_email(&conn, email)? else {
            return Ok(None);
        };
        Ok(auth::verify_password(password, &hash).then_some(user))
    }

    fn issue_token(&self, user: &User) -> Result<String> {
        self.keys
            .issue(&user.id.to_string())
            .map_err(|e| ChatError::Internal(e.to_string()))
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: db::uuid_column(row, 0)?,
        user_name: row.get(1)?,
        email: row.get(2)?,
        pic: row.get(3)?,
        is_admin: row.get::<_, i64>(4)? != 0,
    })
}

const USER_COLUMNS: &str = "id, user_name, email, pic, is_admin";

/// Insert a user with an already hashed password.
pub fn insert_user(conn: &Connection, new: &NewUser, password_hash: &str) -> Result<User> {
    let user = User {
        id: Uuid::new_v4(),
        user_name: new.user_name.trim().to_string(),
        email: new.email.trim().to_string(),
        pic: new.pic.clone().unwrap_or_else(|| DEFAULT_PIC.to_string()),
        is_admin: false,
    };
    let res = conn.execute(
        "INSERT INTO users (id, user_name, email, password_hash, pic, is_admin, created_at) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![
            user.id.to_string(),
            user.user_name,
            user.email,
            password_hash,
            user.pic,
            db::now_millis()
        ],
    );
    match res {
        Ok(_) => Ok(user),
        Err(e)
            if matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ) =>
        {
            Err(ChatError::conflict("user already exists"))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_user(conn: &Connection, id: &Uuid) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            [id.to_string()],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

/// Fetch a user together with its password hash.
pub fn get_user_by_email(conn: &Connection, email: &str) -> Result<Option<(User, String)>> {
    let found = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS}, password_hash FROM users WHERE email = ?1"),
            [email.trim()],
            |row| Ok((row_to_user(row)?, row.get::<_, String>(5)?)),
        )
        .optional()?;
    Ok(found)
}

/// Users whose name or email contains `needle`, ignoring case.
pub fn search_users(conn: &Connection, needle: &str) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users \
         WHERE ?1 = '' OR instr(lower(user_name), lower(?1)) > 0 OR instr(lower(email), lower(?1)) > 0 \
         ORDER BY user_name COLLATE NOCASE, email"
    ))?;
    let users = stmt
        .query_map([needle.trim()], row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}
