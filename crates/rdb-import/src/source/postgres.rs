//! PostgreSQL source dialect.
//!
//! The pipeline drives sources from blocking workers, so every call here
//! parks the worker on the runtime handle captured at connect time. Never
//! call these methods from inside an async task.

use std::future::Future;
use std::io::Read;
use std::sync::Arc;

use bigdecimal::num_bigint::{BigInt, BigUint, Sign};
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::TryStreamExt;
use rustls::ClientConfig;
use tokio::runtime::Handle;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Config as PgConfig, Row, RowStream};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SourceConfig;
use crate::core::schema::{SqlType, TableIdentity};
use crate::core::value::SourceValue;
use crate::error::{ImportError, Result};
use crate::source::memory::MemoryRow;
use crate::source::{ProbedColumn, RowCursor, SourceCatalog, SourceRow};

const LIST_SCHEMAS: &str = "SELECT schema_name::text FROM information_schema.schemata \
     WHERE schema_name NOT IN ('pg_catalog', 'information_schema') \
       AND schema_name NOT LIKE 'pg\\_toast%' \
       AND schema_name NOT LIKE 'pg\\_temp\\_%' \
     ORDER BY schema_name";

const LIST_TABLES: &str = "SELECT table_name::text FROM information_schema.tables \
     WHERE table_schema = $1 AND table_type = 'BASE TABLE' \
     ORDER BY table_name";

const COLUMN_NAMES: &str = "SELECT column_name::text FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2 \
     ORDER BY ordinal_position";

const ROW_COUNT: &str = "SELECT COALESCE(c.reltuples, -1)::int8 \
     FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
     WHERE n.nspname = $1 AND c.relname = $2";

const PRIMARY_KEY: &str = "SELECT a.attname::text \
     FROM pg_constraint c \
     JOIN pg_class t ON t.oid = c.conrelid \
     JOIN pg_namespace n ON n.oid = t.relnamespace \
     JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(c.conkey) \
     WHERE n.nspname = $1 AND t.relname = $2 AND c.contype = 'p' \
     ORDER BY array_position(c.conkey, a.attnum)";

// Plain unique indexes over NOT NULL columns only: no predicate, no expressions.
const UNIQUE_INDEXES: &str = "SELECT array_agg(a.attname::text \
         ORDER BY array_position(ix.indkey::int2[], a.attnum)) \
     FROM pg_index ix \
     JOIN pg_class t ON t.oid = ix.indrelid \
     JOIN pg_namespace n ON n.oid = t.relnamespace \
     JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
     WHERE n.nspname = $1 AND t.relname = $2 \
       AND ix.indisunique AND NOT ix.indisprimary \
       AND ix.indpred IS NULL AND ix.indexprs IS NULL \
     GROUP BY ix.indexrelid \
     HAVING bool_and(a.attnotnull)";

const COLUMN_DETAILS: &str =
    "SELECT atttypmod, attnotnull FROM pg_attribute WHERE attrelid = $1 AND attnum = $2";

/// PostgreSQL implementation of [`SourceCatalog`].
pub struct PostgresSource {
    pool: Pool,
    runtime: Handle,
}

impl PostgresSource {
    /// Create a pool sized `max_conns` and check it with a trivial query.
    /// Must be called inside a Tokio runtime.
    pub async fn connect(config: &SourceConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.user)
            .password(&config.password)
            .application_name("rdb-import");

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let pool = match config.ssl_mode.to_lowercase().as_str() {
            "disable" => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns)
                    .build()
                    .map_err(|e| ImportError::pool(e, "creating PostgreSQL source pool"))?
            }
            mode => {
                let tls_connector = MakeRustlsConnect::new(build_tls_config(mode)?);
                let mgr = Manager::from_config(pg_config, tls_connector, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns)
                    .build()
                    .map_err(|e| ImportError::pool(e, "creating PostgreSQL source pool"))?
            }
        };

        let client = pool
            .get()
            .await
            .map_err(|e| ImportError::pool(e, "testing PostgreSQL source connection"))?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL source: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            runtime: Handle::current(),
        })
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    fn client(&self, context: &str) -> Result<Object> {
        self.block_on(self.pool.get())
            .map_err(|e| ImportError::pool(e, context))
    }

    fn query_strings(&self, sql: &str, params: &[&(dyn tokio_postgres::types::ToSql + Sync)]) -> Result<Vec<String>> {
        let client = self.client("running catalog query")?;
        let rows = self.block_on(client.query(sql, params))?;
        rows.iter()
            .map(|r| r.try_get::<_, String>(0).map_err(ImportError::from))
            .collect()
    }

    /// Typmod and NOT NULL flag of a result column backed by a table column.
    fn column_details(&self, client: &Object, table_oid: u32, attnum: i16) -> Result<Option<(i32, bool)>> {
        let row = self.block_on(client.query_opt(COLUMN_DETAILS, &[&table_oid, &attnum]))?;
        Ok(match row {
            Some(row) => Some((row.try_get(0)?, row.try_get(1)?)),
            None => None,
        })
    }
}

/// Build the rustls configuration for an ssl_mode other than "disable".
fn build_tls_config(ssl_mode: &str) -> Result<ClientConfig> {
    match ssl_mode {
        "require" => {
            warn!(
                "ssl_mode=require: TLS enabled but server certificate is not verified. \
                 Consider using 'verify-full' for production."
            );
            Ok(ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth())
        }
        "verify-full" => {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            info!("ssl_mode=verify-full: certificate and hostname verification enabled");
            Ok(ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth())
        }
        other => Err(ImportError::Config(format!(
            "invalid ssl_mode '{}', expected disable, require or verify-full",
            other
        ))),
    }
}

/// Pick the fallback key among candidate unique indexes: fewest columns,
/// then the lexicographically smallest sorted column list.
pub fn choose_unique_index(candidates: Vec<Vec<String>>) -> Option<Vec<String>> {
    candidates
        .into_iter()
        .filter(|cols| !cols.is_empty())
        .min_by(|a, b| {
            let (mut sa, mut sb) = (a.clone(), b.clone());
            sa.sort();
            sb.sort();
            a.len().cmp(&b.len()).then_with(|| sa.cmp(&sb))
        })
}

/// Source type of a result column.
pub fn sql_type(ty: &Type) -> SqlType {
    match *ty {
        Type::BOOL => SqlType::Boolean,
        Type::CHAR | Type::BPCHAR => SqlType::Char,
        Type::INT2 => SqlType::SmallInt,
        Type::INT4 => SqlType::Integer,
        Type::INT8 | Type::OID => SqlType::BigInt,
        Type::FLOAT4 => SqlType::Real,
        Type::FLOAT8 => SqlType::Double,
        Type::NUMERIC => SqlType::Numeric,
        Type::VARCHAR | Type::TEXT | Type::NAME | Type::JSON | Type::JSONB => SqlType::VarChar,
        Type::UUID => SqlType::Char,
        Type::XML => SqlType::SqlXml,
        Type::BYTEA => SqlType::Binary,
        Type::DATE => SqlType::Date,
        Type::TIME => SqlType::Time,
        Type::TIMETZ => SqlType::TimeWithTimezone,
        Type::TIMESTAMP => SqlType::Timestamp,
        Type::TIMESTAMPTZ => SqlType::TimestampWithTimezone,
        _ if matches!(ty.kind(), Kind::Enum(_)) => SqlType::VarChar,
        _ => SqlType::Other(1111),
    }
}

/// Precision and scale encoded in a column's typmod.
pub fn typmod_precision(ty: &Type, typmod: i32) -> (i32, i32) {
    match *ty {
        Type::NUMERIC if typmod >= 4 => {
            let packed = typmod - 4;
            ((packed >> 16) & 0xffff, packed & 0xffff)
        }
        Type::VARCHAR | Type::BPCHAR if typmod >= 4 => (typmod - 4, 0),
        Type::TIME | Type::TIMETZ | Type::TIMESTAMP | Type::TIMESTAMPTZ => {
            (0, if typmod >= 0 { typmod } else { 6 })
        }
        Type::UUID => (36, 0),
        _ => (0, 0),
    }
}

impl SourceCatalog for PostgresSource {
    fn dialect(&self) -> &str {
        "postgres"
    }

    fn list_schemas(&self) -> Result<Vec<String>> {
        self.query_strings(LIST_SCHEMAS, &[])
    }

    fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        self.query_strings(LIST_TABLES, &[&schema])
    }

    fn grab_column_names(&self, table: &TableIdentity) -> Result<Vec<String>> {
        self.query_strings(COLUMN_NAMES, &[&table.schema, &table.table])
    }

    fn grab_row_count(&self, table: &TableIdentity) -> Result<i64> {
        let client = self.client("reading row count")?;
        let row = self.block_on(client.query_opt(ROW_COUNT, &[&table.schema, &table.table]))?;
        match row {
            Some(row) => Ok(row.try_get::<_, i64>(0)?),
            None => Ok(-1),
        }
    }

    fn grab_primary_key(&self, table: &TableIdentity) -> Result<Vec<String>> {
        let key = self.query_strings(PRIMARY_KEY, &[&table.schema, &table.table])?;
        if !key.is_empty() {
            return Ok(key);
        }
        let client = self.client("reading unique indexes")?;
        let rows = self.block_on(client.query(UNIQUE_INDEXES, &[&table.schema, &table.table]))?;
        let candidates = rows
            .iter()
            .map(|r| r.try_get::<_, Vec<String>>(0))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let chosen = choose_unique_index(candidates).unwrap_or_default();
        if !chosen.is_empty() {
            debug!("{}: no primary key, using unique index on ({})", table, chosen.join(", "));
        }
        Ok(chosen)
    }

    fn describe_result(&self, sql: &str) -> Result<Vec<ProbedColumn>> {
        let client = self.client("describing query")?;
        let statement = self.block_on(client.prepare(sql))?;
        let mut probed = Vec::with_capacity(statement.columns().len());
        for column in statement.columns() {
            let ty = column.type_();
            let details = match (column.table_oid(), column.column_id()) {
                (Some(oid), Some(attnum)) if oid != 0 && attnum > 0 => {
                    self.column_details(&client, oid, attnum)?
                }
                _ => None,
            };
            let (typmod, not_null) = details.unwrap_or((-1, false));
            let (precision, scale) = typmod_precision(ty, typmod);
            let mut col = ProbedColumn::new(column.name(), sql_type(ty)).with_precision(precision, scale);
            if not_null {
                col = col.not_null();
            }
            probed.push(col);
        }
        Ok(probed)
    }

    fn safe_id(&self, id: &str) -> String {
        format!("\"{}\"", id.replace('"', "\"\""))
    }

    fn open_cursor(&self, sql: &str) -> Result<Box<dyn RowCursor + '_>> {
        let client = self.client("opening cursor")?;
        let stream = self.block_on(client.query_raw(sql, Vec::<String>::new()))?;
        Ok(Box::new(PgCursor {
            _client: client,
            stream: Box::pin(stream),
            current: None,
            runtime: self.runtime.clone(),
        }))
    }
}

/// Forward-only cursor over a streamed query. Holds its pooled connection
/// until dropped.
struct PgCursor {
    _client: Object,
    stream: std::pin::Pin<Box<RowStream>>,
    current: Option<MemoryRow>,
    runtime: Handle,
}

impl PgCursor {
    fn row(&self) -> Result<&MemoryRow> {
        self.current
            .as_ref()
            .ok_or_else(|| ImportError::Catalog("cursor is not positioned on a row".into()))
    }
}

impl RowCursor for PgCursor {
    fn advance(&mut self) -> Result<bool> {
        let next = self.runtime.block_on(self.stream.as_mut().try_next())?;
        match next {
            Some(row) => {
                let values = (0..row.len())
                    .map(|idx| decode(&row, idx))
                    .collect::<Result<Vec<_>>>()?;
                self.current = Some(MemoryRow::new(values));
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }
}

impl SourceRow for PgCursor {
    fn get_bool(&self, idx: usize) -> Result<Option<bool>> {
        self.row()?.get_bool(idx)
    }

    fn get_i32(&self, idx: usize) -> Result<Option<i32>> {
        self.row()?.get_i32(idx)
    }

    fn get_i64(&self, idx: usize) -> Result<Option<i64>> {
        self.row()?.get_i64(idx)
    }

    fn get_f32(&self, idx: usize) -> Result<Option<f32>> {
        self.row()?.get_f32(idx)
    }

    fn get_f64(&self, idx: usize) -> Result<Option<f64>> {
        self.row()?.get_f64(idx)
    }

    fn get_decimal(&self, idx: usize) -> Result<Option<BigDecimal>> {
        self.row()?.get_decimal(idx)
    }

    fn get_string(&self, idx: usize) -> Result<Option<String>> {
        self.row()?.get_string(idx)
    }

    fn get_bytes(&self, idx: usize) -> Result<Option<Vec<u8>>> {
        self.row()?.get_bytes(idx)
    }

    fn get_date(&self, idx: usize) -> Result<Option<NaiveDate>> {
        self.row()?.get_date(idx)
    }

    fn get_time(&self, idx: usize) -> Result<Option<NaiveTime>> {
        self.row()?.get_time(idx)
    }

    fn get_timestamp(&self, idx: usize) -> Result<Option<NaiveDateTime>> {
        self.row()?.get_timestamp(idx)
    }

    fn get_uuid(&self, idx: usize) -> Result<Option<Uuid>> {
        self.row()?.get_uuid(idx)
    }

    fn open_blob(&self, idx: usize) -> Result<Option<Box<dyn Read + '_>>> {
        self.row()?.open_blob(idx)
    }
}

/// Text-format payload of a text-like column. `jsonb` carries a one-byte
/// version header in binary format.
struct RawText(String);

impl<'a> FromSql<'a> for RawText {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let body = if *ty == Type::JSONB {
            raw.strip_prefix(&[1u8]).unwrap_or(raw)
        } else {
            raw
        };
        Ok(RawText(String::from_utf8(body.to_vec())?))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// `numeric` at full precision. `NaN` and the infinities have no decimal
/// form and fail the row.
struct PgNumeric(BigDecimal);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(PgNumeric(numeric_from_wire(raw)?))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Decode the binary `numeric` layout: digit count, weight, sign and display
/// scale, then base-10000 digits, most significant first.
fn numeric_from_wire(raw: &[u8]) -> std::result::Result<BigDecimal, String> {
    let word = |i: usize| -> std::result::Result<u16, String> {
        raw.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| format!("numeric value truncated at word {}", i))
    };
    let n_digits = word(0)?;
    let weight = word(1)? as i16;
    let sign = match word(2)? {
        0x0000 => Sign::Plus,
        0x4000 => Sign::Minus,
        0xC000 => return Err("numeric NaN has no decimal value".to_string()),
        0xD000 | 0xF000 => return Err("numeric infinity has no decimal value".to_string()),
        other => return Err(format!("invalid numeric sign {:#06x}", other)),
    };
    let display_scale = word(3)?;

    let mut unscaled = BigUint::from(0u32);
    for i in 0..usize::from(n_digits) {
        unscaled = unscaled * 10_000u32 + u32::from(word(4 + i)?);
    }
    // The last digit stands for 10000^(weight - n_digits + 1).
    let exponent = 4 * (i64::from(weight) - i64::from(n_digits) + 1);
    Ok(BigDecimal::new(BigInt::from_biguint(sign, unscaled), -exponent)
        .with_scale(i64::from(display_scale)))
}

/// Binary wire value of a type without a dedicated decoder.
struct RawBytes(Vec<u8>);

impl<'a> FromSql<'a> for RawBytes {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(RawBytes(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn decode(row: &Row, idx: usize) -> Result<SourceValue> {
    let ty = row.columns()[idx].type_();
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(SourceValue::Bool),
        Type::CHAR => row.try_get::<_, Option<i8>>(idx)?.map(|v| SourceValue::Int(v.into())),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(|v| SourceValue::Int(v.into())),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(|v| SourceValue::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(SourceValue::Int),
        Type::OID => row.try_get::<_, Option<u32>>(idx)?.map(|v| SourceValue::Int(v.into())),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(SourceValue::Float),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(SourceValue::Double),
        Type::NUMERIC => row.try_get::<_, Option<PgNumeric>>(idx)?.map(|n| SourceValue::Decimal(n.0)),
        Type::BPCHAR | Type::VARCHAR | Type::TEXT | Type::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(SourceValue::Text)
        }
        Type::JSON | Type::JSONB | Type::XML => {
            row.try_get::<_, Option<RawText>>(idx)?.map(|t| SourceValue::Text(t.0))
        }
        Type::UUID => row.try_get::<_, Option<Uuid>>(idx)?.map(SourceValue::Uuid),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SourceValue::Bytes),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(SourceValue::Date),
        Type::TIME => row.try_get::<_, Option<NaiveTime>>(idx)?.map(SourceValue::Time),
        Type::TIMESTAMP => row.try_get::<_, Option<NaiveDateTime>>(idx)?.map(SourceValue::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|ts| SourceValue::Timestamp(ts.naive_utc())),
        _ if matches!(ty.kind(), Kind::Enum(_)) => {
            row.try_get::<_, Option<RawText>>(idx)?.map(|t| SourceValue::Text(t.0))
        }
        _ => row.try_get::<_, Option<RawBytes>>(idx)?.map(|b| SourceValue::Bytes(b.0)),
    };
    Ok(value.unwrap_or(SourceValue::Null))
}

/// Certificate verifier that accepts any server certificate.
///
/// Only used for `ssl_mode=require`, which asks for encryption without
/// authentication of the server.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
