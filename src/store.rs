//! Aerospike-facing side of the gateway: shared connection context, policy
//! construction and the small set of store calls the commands are built from.

use color_eyre::eyre::eyre;
use color_eyre::Result;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use aerospike::errors::{Error as AsError, ErrorKind};
use aerospike::operations;
use aerospike::{
    Bin, Bins, Client, CommitLevel, ConsistencyLevel, Expiration, Key, ReadPolicy, Record,
    RecordExistsAction, ResultCode, Value, WritePolicy,
};

/// Bin holding scalar and list payloads (lists keep their cardinality in
/// `r_size` next to it).
pub const BIN_NAME: &str = "r";

/// UDF package registered on the server for list and hash operations.
pub const UDF_PACKAGE: &str = "redis";

/// Record expirations are expressed in seconds since this epoch
/// (2010-01-01T00:00:00Z).
const CITRUSLEAF_EPOCH: u64 = 1_262_304_000;

/// Derive a write policy from the defaults. `ttl` is in seconds with `-1`
/// meaning the server default; `create_only` makes the store refuse to
/// overwrite an existing record.
pub fn write_policy_with(ttl: i64, create_only: bool) -> WritePolicy {
    let expiration = if ttl == -1 {
        Expiration::NamespaceDefault
    } else {
        Expiration::Seconds(ttl as u32)
    };
    let mut policy = WritePolicy::new(0, expiration);
    policy.commit_level = CommitLevel::CommitMaster;
    if create_only {
        policy.record_exists_action = RecordExistsAction::CreateOnly;
    }
    policy
}

/// Immutable per-process state shared read-only by every connection.
pub struct Context {
    client: Arc<Client>,
    namespace: String,
    set: String,
    read_policy: ReadPolicy,
    write_policy: WritePolicy,
}

impl Context {
    /// Build the shared context with the default read and write policies:
    /// consistency level one, commit level master.
    pub fn new(client: Arc<Client>, namespace: String, set: String) -> Self {
        let mut read_policy = ReadPolicy::default();
        read_policy.consistency_level = ConsistencyLevel::ConsistencyOne;
        Context {
            client,
            namespace,
            set,
            read_policy,
            write_policy: write_policy_with(-1, false),
        }
    }

    /// The default write policy (namespace-default TTL, overwrite allowed).
    pub fn write_policy(&self) -> &WritePolicy {
        &self.write_policy
    }

    /// Build the store key for a client-supplied key. Keys are interpreted as
    /// text.
    pub fn key(&self, raw: &[u8]) -> Result<Key> {
        let text = std::str::from_utf8(raw)?;
        Key::new(
            self.namespace.clone(),
            self.set.clone(),
            Value::String(text.to_string()),
        )
        .map_err(store_err)
    }

    /// Read the named bins. `None` when the record does not exist.
    pub fn get(&self, key: &Key, bins: &[String]) -> Result<Option<Record>> {
        match self
            .client
            .get(&self.read_policy, key, Bins::Some(bins.to_vec()))
        {
            Ok(rec) => Ok(Some(rec)),
            Err(AsError(ErrorKind::ServerError(ResultCode::KeyNotFoundError), _)) => Ok(None),
            Err(err) => Err(store_err(err)),
        }
    }

    /// Read the record header only (existence and TTL). `None` when absent.
    pub fn get_header(&self, key: &Key) -> Result<Option<Record>> {
        match self.client.get(&self.read_policy, key, Bins::None) {
            Ok(rec) => Ok(Some(rec)),
            Err(AsError(ErrorKind::ServerError(ResultCode::KeyNotFoundError), _)) => Ok(None),
            Err(err) => Err(store_err(err)),
        }
    }

    /// Replace the named bins wholesale. Returns `false` when a create-only
    /// policy found the key already present.
    pub fn put(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<bool> {
        match self.client.put(policy, key, bins) {
            Ok(()) => Ok(true),
            Err(AsError(ErrorKind::ServerError(ResultCode::KeyExistsError), _)) => Ok(false),
            Err(err) => Err(store_err(err)),
        }
    }

    /// Delete the record; `true` when it existed.
    pub fn delete(&self, key: &Key) -> Result<bool> {
        self.client
            .delete(&self.write_policy, key)
            .map_err(store_err)
    }

    /// Reset the record's TTL. Returns `false` when the key does not exist.
    pub fn touch(&self, policy: &WritePolicy, key: &Key) -> Result<bool> {
        match self.client.touch(policy, key) {
            Ok(()) => Ok(true),
            Err(AsError(ErrorKind::ServerError(ResultCode::KeyNotFoundError), _)) => Ok(false),
            Err(err) => Err(store_err(err)),
        }
    }

    /// Atomically add `delta` to a bin and read it back in the same call.
    /// `None` when the bin holds a non-integer value.
    pub fn operate_add_get(
        &self,
        policy: &WritePolicy,
        key: &Key,
        bin_name: &str,
        delta: i64,
    ) -> Result<Option<Record>> {
        let bin = Bin::new(bin_name, Value::Int(delta));
        let ops = [operations::add(&bin), operations::get_bin(bin_name)];
        match self.client.operate(policy, key, &ops) {
            Ok(rec) => Ok(Some(rec)),
            Err(AsError(ErrorKind::ServerError(ResultCode::BinTypeError), _)) => Ok(None),
            Err(err) => Err(store_err(err)),
        }
    }

    /// Invoke a function of the `redis` UDF package on the record.
    pub fn execute(
        &self,
        policy: &WritePolicy,
        key: &Key,
        function: &str,
        args: &[Value],
    ) -> Result<Option<Value>> {
        self.client
            .execute_udf(policy, key, UDF_PACKAGE, function, Some(args))
            .map_err(store_err)
    }
}

/// Expiration of a record in the store's own representation: seconds since
/// the citrusleaf epoch, `0` for "never expires".
pub fn record_expiration(rec: &Record) -> u64 {
    match rec.time_to_live() {
        None => 0,
        Some(ttl) => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            now.as_secs().saturating_sub(CITRUSLEAF_EPOCH) + ttl.as_secs()
        }
    }
}

// The client's error type is not Sync, so it cannot ride inside an eyre
// report; the message text is what ends up on the wire anyway.
fn store_err(err: AsError) -> color_eyre::Report {
    eyre!("{err}")
}
