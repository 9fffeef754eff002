use redb::TableDefinition;

/// File records: file_id -> FileRecord (msgpack)
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Identity index: "file_name\0checksum" -> file_id (dedup lookups)
pub const FILE_IDENTITIES: TableDefinition<&str, &str> = TableDefinition::new("file_identities");

/// Name index: file_name -> msgpack Vec of file_ids
pub const FILE_NAMES: TableDefinition<&str, &[u8]> = TableDefinition::new("file_names");

/// Active leases: lock key -> LeaseRecord (msgpack)
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

/// Counters: "version:<id>" and "fence:<key>" -> u64
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
