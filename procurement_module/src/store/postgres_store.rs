use std::time::Duration;

use chrono::{DateTime, Utc};
use postgres::Row;
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::error;
use uuid::Uuid;

use super::{ProcurementStore, StoreError};
use crate::models::{
    normalize_vendor_email, AttachmentMeta, DispatchStatus, LineItem, NewDispatch, NewProposal,
    NewRfp, NewUser, NewVendor, Proposal, ProposalFields, Requirements, Rfp, SentDispatch, User,
    Vendor, VendorProposal,
};

type PgPool = Pool<PostgresConnectionManager<MakeTlsConnector>>;
type PgConnection = PooledConnection<PostgresConnectionManager<MakeTlsConnector>>;

const USER_COLUMNS: &str = "id, email, username, name, created_at";
const VENDOR_COLUMNS: &str = "id, name, contact_email, phone, notes, metadata_json, created_at";
const RFP_COLUMNS: &str = "id, title, description_raw, requirements_json, budget_usd, \
     delivery_days, payment_terms, warranty_months, reference_token, created_by_id, created_at";
const DISPATCH_COLUMNS: &str =
    "id, rfp_id, vendor_id, reference_id, message_id, status, sent_at, reply_to, created_at";
const PROPOSAL_COLUMNS: &str = "id, rfp_id, vendor_id, sent_rfp_reference, raw_email_body, \
     attachments_json, parsed_at, price_usd, line_items_json, delivery_days, warranty_months, \
     payment_terms, completeness_score, created_at";

/// Logs the underlying connection error instead of dropping it.
#[derive(Debug)]
struct LoggingErrorHandler;

impl r2d2::HandleError<postgres::Error> for LoggingErrorHandler {
    fn handle_error(&self, err: postgres::Error) {
        error!("postgres connection pool error: {:?}", err);
    }
}

pub struct PostgresProcurementStore {
    pool: Option<PgPool>,
}

impl PostgresProcurementStore {
    pub fn new(db_url: &str, tls_allow_invalid_certs: bool) -> Result<Self, StoreError> {
        let config: postgres::Config = db_url.parse()?;
        let mut tls_builder = native_tls::TlsConnector::builder();
        if tls_allow_invalid_certs {
            tls_builder.danger_accept_invalid_certs(true);
            tls_builder.danger_accept_invalid_hostnames(true);
        }
        let tls_connector = tls_builder
            .build()
            .map_err(|err| StoreError::Config(err.to_string()))?;
        let tls = MakeTlsConnector::new(tls_connector);

        let manager = PostgresConnectionManager::new(config, tls);
        let pool = Pool::builder()
            .max_size(8)
            .idle_timeout(Some(Duration::from_secs(300)))
            .error_handler(Box::new(LoggingErrorHandler))
            .build(manager)?;
        let store = Self { pool: Some(pool) };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connection(&self) -> Result<PgConnection, StoreError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| StoreError::Config("postgres pool unavailable".to_string()))?;
        Ok(pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.batch_execute(
            "CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL,
                name TEXT,
                password TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE TABLE IF NOT EXISTS vendors (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                contact_email TEXT NOT NULL UNIQUE,
                phone TEXT,
                notes TEXT,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                password TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE TABLE IF NOT EXISTS rfps (
                id UUID PRIMARY KEY,
                title TEXT NOT NULL,
                description_raw TEXT NOT NULL,
                requirements_json TEXT NOT NULL,
                budget_usd DOUBLE PRECISION,
                delivery_days INTEGER,
                payment_terms TEXT,
                warranty_months INTEGER,
                reference_token TEXT NOT NULL UNIQUE,
                created_by_id UUID NOT NULL REFERENCES users(id),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE TABLE IF NOT EXISTS sent_rfps (
                id UUID PRIMARY KEY,
                rfp_id UUID NOT NULL REFERENCES rfps(id),
                vendor_id UUID NOT NULL REFERENCES vendors(id),
                reference_id TEXT NOT NULL UNIQUE,
                message_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                sent_at TIMESTAMPTZ,
                reply_to TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS sent_rfps_vendor_created_idx
                ON sent_rfps(vendor_id, created_at DESC);
            CREATE TABLE IF NOT EXISTS proposals (
                id UUID PRIMARY KEY,
                rfp_id UUID NOT NULL REFERENCES rfps(id),
                vendor_id UUID NOT NULL REFERENCES vendors(id),
                sent_rfp_reference TEXT,
                raw_email_body TEXT NOT NULL,
                attachments_json TEXT NOT NULL DEFAULT '[]',
                parsed_at TIMESTAMPTZ,
                price_usd DOUBLE PRECISION,
                line_items_json TEXT,
                delivery_days INTEGER,
                warranty_months INTEGER,
                payment_terms TEXT,
                completeness_score DOUBLE PRECISION,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS proposals_rfp_created_idx
                ON proposals(rfp_id, created_at);",
        )?;
        Ok(())
    }

    fn query_one_dispatch(
        &self,
        sql: &str,
        params: &[&(dyn postgres::types::ToSql + Sync)],
    ) -> Result<Option<SentDispatch>, StoreError> {
        let mut conn = self.connection()?;
        conn.query_opt(sql, params)?
            .map(|row| dispatch_from_row(&row))
            .transpose()
    }

    fn proposal_by_id(&self, conn: &mut PgConnection, id: Uuid) -> Result<Proposal, StoreError> {
        let row = conn
            .query_opt(
                &format!("SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = $1"),
                &[&id],
            )?
            .ok_or_else(|| StoreError::not_found("proposal", id))?;
        proposal_from_row(&row)
    }

    fn dispatch_by_id(&self, conn: &mut PgConnection, id: Uuid) -> Result<SentDispatch, StoreError> {
        let row = conn
            .query_opt(
                &format!("SELECT {DISPATCH_COLUMNS} FROM sent_rfps WHERE id = $1"),
                &[&id],
            )?
            .ok_or_else(|| StoreError::not_found("sent_rfp", id))?;
        dispatch_from_row(&row)
    }

    #[cfg(test)]
    fn clear_tables_for_tests(&self) {
        if let Ok(mut conn) = self.connection() {
            let _ = conn.batch_execute(
                "DELETE FROM proposals; DELETE FROM sent_rfps; DELETE FROM rfps;
                 DELETE FROM vendors; DELETE FROM users;",
            );
        }
    }
}

impl Drop for PostgresProcurementStore {
    fn drop(&mut self) {
        // r2d2 may block while closing connections; keep that off async workers.
        if let Some(pool) = self.pool.take() {
            let _ = std::thread::spawn(move || drop(pool));
        }
    }
}

impl ProcurementStore for PostgresProcurementStore {
    fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let mut conn = self.connection()?;
        conn.query_opt(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"), &[&id])?
            .map(|row| user_from_row(&row))
            .transpose()
    }

    fn get_or_create_user(&self, new: &NewUser) -> Result<User, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_one(
            &format!(
                "INSERT INTO users (id, email, username, name, password, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email
                 RETURNING {USER_COLUMNS}"
            ),
            &[
                &Uuid::new_v4(),
                &new.email,
                &new.username,
                &new.name,
                &new.credential,
                &Utc::now(),
            ],
        )?;
        user_from_row(&row)
    }

    fn create_rfp(&self, new: &NewRfp) -> Result<Rfp, StoreError> {
        let mut conn = self.connection()?;
        let requirements_json = serde_json::to_string(&new.requirements)?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO rfps (id, title, description_raw, requirements_json, budget_usd,
                        delivery_days, payment_terms, warranty_months, reference_token,
                        created_by_id, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                     RETURNING {RFP_COLUMNS}"
                ),
                &[
                    &Uuid::new_v4(),
                    &new.title,
                    &new.description_raw,
                    &requirements_json,
                    &new.budget_usd,
                    &new.delivery_days,
                    &new.payment_terms,
                    &new.warranty_months,
                    &new.reference_token,
                    &new.created_by_id,
                    &Utc::now(),
                ],
            )
            .map_err(|err| map_unique_violation(err, "rfps.reference_token"))?;
        rfp_from_row(&row)
    }

    fn get_or_create_rfp_by_token(&self, new: &NewRfp) -> Result<Rfp, StoreError> {
        let mut conn = self.connection()?;
        let requirements_json = serde_json::to_string(&new.requirements)?;
        let row = conn.query_one(
            &format!(
                "INSERT INTO rfps (id, title, description_raw, requirements_json, budget_usd,
                    delivery_days, payment_terms, warranty_months, reference_token,
                    created_by_id, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (reference_token)
                    DO UPDATE SET reference_token = EXCLUDED.reference_token
                 RETURNING {RFP_COLUMNS}"
            ),
            &[
                &Uuid::new_v4(),
                &new.title,
                &new.description_raw,
                &requirements_json,
                &new.budget_usd,
                &new.delivery_days,
                &new.payment_terms,
                &new.warranty_months,
                &new.reference_token,
                &new.created_by_id,
                &Utc::now(),
            ],
        )?;
        rfp_from_row(&row)
    }

    fn get_rfp(&self, id: Uuid) -> Result<Option<Rfp>, StoreError> {
        let mut conn = self.connection()?;
        conn.query_opt(&format!("SELECT {RFP_COLUMNS} FROM rfps WHERE id = $1"), &[&id])?
            .map(|row| rfp_from_row(&row))
            .transpose()
    }

    fn get_vendor(&self, id: Uuid) -> Result<Option<Vendor>, StoreError> {
        let mut conn = self.connection()?;
        conn.query_opt(
            &format!("SELECT {VENDOR_COLUMNS} FROM vendors WHERE id = $1"),
            &[&id],
        )?
        .map(|row| vendor_from_row(&row))
        .transpose()
    }

    fn find_vendor_by_email(&self, email: &str) -> Result<Option<Vendor>, StoreError> {
        let mut conn = self.connection()?;
        let email = normalize_vendor_email(email);
        conn.query_opt(
            &format!("SELECT {VENDOR_COLUMNS} FROM vendors WHERE contact_email = $1"),
            &[&email],
        )?
        .map(|row| vendor_from_row(&row))
        .transpose()
    }

    fn get_or_create_vendor(&self, new: &NewVendor) -> Result<Vendor, StoreError> {
        let mut conn = self.connection()?;
        let email = normalize_vendor_email(&new.contact_email);
        let row = conn.query_one(
            &format!(
                "INSERT INTO vendors (id, name, contact_email, notes, metadata_json, password, created_at)
                 VALUES ($1, $2, $3, $4, '{{}}', $5, $6)
                 ON CONFLICT (contact_email) DO UPDATE SET contact_email = EXCLUDED.contact_email
                 RETURNING {VENDOR_COLUMNS}"
            ),
            &[
                &Uuid::new_v4(),
                &new.name,
                &email,
                &new.notes,
                &new.credential,
                &Utc::now(),
            ],
        )?;
        vendor_from_row(&row)
    }

    fn create_dispatch(&self, new: &NewDispatch) -> Result<SentDispatch, StoreError> {
        let mut conn = self.connection()?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO sent_rfps (id, rfp_id, vendor_id, reference_id, message_id, status, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     RETURNING {DISPATCH_COLUMNS}"
                ),
                &[
                    &Uuid::new_v4(),
                    &new.rfp_id,
                    &new.vendor_id,
                    &new.reference_id,
                    &new.message_id,
                    &DispatchStatus::Draft.as_str(),
                    &Utc::now(),
                ],
            )
            .map_err(|err| map_unique_violation(err, "sent_rfps.reference_id"))?;
        dispatch_from_row(&row)
    }

    fn find_dispatch_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<SentDispatch>, StoreError> {
        self.query_one_dispatch(
            &format!("SELECT {DISPATCH_COLUMNS} FROM sent_rfps WHERE message_id = $1"),
            &[&message_id],
        )
    }

    fn find_dispatch_by_reference_id(
        &self,
        reference_id: &str,
    ) -> Result<Option<SentDispatch>, StoreError> {
        self.query_one_dispatch(
            &format!("SELECT {DISPATCH_COLUMNS} FROM sent_rfps WHERE reference_id = $1"),
            &[&reference_id],
        )
    }

    fn latest_dispatch_for_vendor(
        &self,
        vendor_id: Uuid,
    ) -> Result<Option<SentDispatch>, StoreError> {
        self.query_one_dispatch(
            &format!(
                "SELECT {DISPATCH_COLUMNS} FROM sent_rfps
                 WHERE vendor_id = $1
                 ORDER BY created_at DESC
                 LIMIT 1"
            ),
            &[&vendor_id],
        )
    }

    fn mark_dispatch_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
        reply_to: &str,
    ) -> Result<SentDispatch, StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "UPDATE sent_rfps
             SET status = $2, sent_at = $3, reply_to = $4
             WHERE id = $1 AND status <> $5",
            &[
                &id,
                &DispatchStatus::Sent.as_str(),
                &sent_at,
                &reply_to,
                &DispatchStatus::Delivered.as_str(),
            ],
        )?;
        self.dispatch_by_id(&mut conn, id)
    }

    fn set_dispatch_status(
        &self,
        id: Uuid,
        status: DispatchStatus,
    ) -> Result<SentDispatch, StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "UPDATE sent_rfps SET status = $2 WHERE id = $1 AND status <> $3",
            &[&id, &status.as_str(), &DispatchStatus::Delivered.as_str()],
        )?;
        self.dispatch_by_id(&mut conn, id)
    }

    fn create_proposal(&self, new: &NewProposal) -> Result<Proposal, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_one(
            &format!(
                "INSERT INTO proposals (id, rfp_id, vendor_id, sent_rfp_reference, raw_email_body,
                    attachments_json, created_at)
                 VALUES ($1, $2, $3, $4, $5, '[]', $6)
                 RETURNING {PROPOSAL_COLUMNS}"
            ),
            &[
                &Uuid::new_v4(),
                &new.rfp_id,
                &new.vendor_id,
                &new.sent_rfp_reference,
                &new.raw_email_body,
                &Utc::now(),
            ],
        )?;
        proposal_from_row(&row)
    }

    fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>, StoreError> {
        let mut conn = self.connection()?;
        conn.query_opt(
            &format!("SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = $1"),
            &[&id],
        )?
        .map(|row| proposal_from_row(&row))
        .transpose()
    }

    fn append_proposal_attachments(
        &self,
        id: Uuid,
        attachments: &[AttachmentMeta],
    ) -> Result<Proposal, StoreError> {
        let mut conn = self.connection()?;
        let mut tx = conn.transaction()?;
        let row = tx
            .query_opt(
                "SELECT attachments_json FROM proposals WHERE id = $1 FOR UPDATE",
                &[&id],
            )?
            .ok_or_else(|| StoreError::not_found("proposal", id))?;
        let current: String = row.try_get(0)?;
        let mut stored: Vec<AttachmentMeta> = serde_json::from_str(&current)?;
        stored.extend_from_slice(attachments);
        tx.execute(
            "UPDATE proposals SET attachments_json = $2 WHERE id = $1",
            &[&id, &serde_json::to_string(&stored)?],
        )?;
        tx.commit()?;
        self.proposal_by_id(&mut conn, id)
    }

    fn apply_proposal_fields(
        &self,
        id: Uuid,
        fields: &ProposalFields,
        parsed_at: DateTime<Utc>,
    ) -> Result<Proposal, StoreError> {
        let mut conn = self.connection()?;
        let line_items_json = fields
            .line_items
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let updated = conn.execute(
            "UPDATE proposals
             SET price_usd = $2, line_items_json = $3, delivery_days = $4, warranty_months = $5,
                 payment_terms = $6, completeness_score = $7, parsed_at = $8
             WHERE id = $1",
            &[
                &id,
                &fields.price_usd,
                &line_items_json,
                &fields.delivery_days,
                &fields.warranty_months,
                &fields.payment_terms,
                &fields.completeness_score,
                &parsed_at,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found("proposal", id));
        }
        self.proposal_by_id(&mut conn, id)
    }

    fn list_proposals_for_rfp(&self, rfp_id: Uuid) -> Result<Vec<VendorProposal>, StoreError> {
        let mut conn = self.connection()?;
        let proposal_columns = PROPOSAL_COLUMNS
            .split(", ")
            .map(|column| format!("p.{}", column.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let vendor_columns = VENDOR_COLUMNS
            .split(", ")
            .map(|column| format!("v.{}", column.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = conn.query(
            &format!(
                "SELECT {proposal_columns}, {vendor_columns}
                 FROM proposals p
                 JOIN vendors v ON v.id = p.vendor_id
                 WHERE p.rfp_id = $1
                 ORDER BY p.created_at ASC"
            ),
            &[&rfp_id],
        )?;
        let vendor_offset = PROPOSAL_COLUMNS.split(", ").count();
        rows.iter()
            .map(|row| {
                Ok::<_, StoreError>(VendorProposal {
                    proposal: proposal_from_row(row)?,
                    vendor: vendor_from_row_at(row, vendor_offset)?,
                })
            })
            .collect()
    }
}

fn map_unique_violation(err: postgres::Error, constraint: &str) -> StoreError {
    if err.code() == Some(&postgres::error::SqlState::UNIQUE_VIOLATION) {
        StoreError::Conflict(constraint.to_string())
    } else {
        StoreError::Postgres(err)
    }
}

fn user_from_row(row: &Row) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get(0)?,
        email: row.try_get(1)?,
        username: row.try_get(2)?,
        name: row.try_get(3)?,
        created_at: row.try_get(4)?,
    })
}

fn vendor_from_row(row: &Row) -> Result<Vendor, StoreError> {
    vendor_from_row_at(row, 0)
}

fn vendor_from_row_at(row: &Row, offset: usize) -> Result<Vendor, StoreError> {
    let metadata_json: String = row.try_get(offset + 5)?;
    Ok(Vendor {
        id: row.try_get(offset)?,
        name: row.try_get(offset + 1)?,
        contact_email: row.try_get(offset + 2)?,
        phone: row.try_get(offset + 3)?,
        notes: row.try_get(offset + 4)?,
        metadata: serde_json::from_str(&metadata_json)?,
        created_at: row.try_get(offset + 6)?,
    })
}

fn rfp_from_row(row: &Row) -> Result<Rfp, StoreError> {
    let requirements_json: String = row.try_get(3)?;
    let requirements: Requirements = serde_json::from_str(&requirements_json)?;
    Ok(Rfp {
        id: row.try_get(0)?,
        title: row.try_get(1)?,
        description_raw: row.try_get(2)?,
        requirements,
        budget_usd: row.try_get(4)?,
        delivery_days: row.try_get(5)?,
        payment_terms: row.try_get(6)?,
        warranty_months: row.try_get(7)?,
        reference_token: row.try_get(8)?,
        created_by_id: row.try_get(9)?,
        created_at: row.try_get(10)?,
    })
}

fn dispatch_from_row(row: &Row) -> Result<SentDispatch, StoreError> {
    let status: String = row.try_get(5)?;
    Ok(SentDispatch {
        id: row.try_get(0)?,
        rfp_id: row.try_get(1)?,
        vendor_id: row.try_get(2)?,
        reference_id: row.try_get(3)?,
        message_id: row.try_get(4)?,
        status: status.parse().map_err(StoreError::InvalidValue)?,
        sent_at: row.try_get(6)?,
        reply_to: row.try_get(7)?,
        created_at: row.try_get(8)?,
    })
}

fn proposal_from_row(row: &Row) -> Result<Proposal, StoreError> {
    let attachments_json: String = row.try_get(5)?;
    let line_items_json: Option<String> = row.try_get(8)?;
    let line_items: Option<Vec<LineItem>> = line_items_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    Ok(Proposal {
        id: row.try_get(0)?,
        rfp_id: row.try_get(1)?,
        vendor_id: row.try_get(2)?,
        sent_rfp_reference: row.try_get(3)?,
        raw_email_body: row.try_get(4)?,
        attachments: serde_json::from_str(&attachments_json)?,
        parsed_at: row.try_get(6)?,
        fields: ProposalFields {
            price_usd: row.try_get(7)?,
            line_items,
            delivery_days: row.try_get(9)?,
            warranty_months: row.try_get(10)?,
            payment_terms: row.try_get(11)?,
            completeness_score: row.try_get(12)?,
        },
        created_at: row.try_get(13)?,
    })
}
