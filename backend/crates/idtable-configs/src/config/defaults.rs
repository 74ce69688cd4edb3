// Default value functions

pub fn default_table_prefix() -> String {
    String::new()
}

pub fn default_users_table() -> String {
    "AspNetUsers".to_string()
}

pub fn default_index_table() -> String {
    "AspNetIndex".to_string()
}

pub fn default_roles_table() -> String {
    "AspNetRoles".to_string()
}

pub fn default_true() -> bool {
    true
}

pub fn default_page_size() -> usize {
    100
}

pub fn default_max_concurrent_batches() -> usize {
    10
}

/// Upper bound on partition-key clauses in one combined filter.
pub fn default_max_filter_partitions() -> usize {
    50
}

/// Store limit on operations per atomic batch.
pub fn default_max_batch_size() -> usize {
    100
}

pub fn default_max_concurrent_partitions() -> usize {
    10
}

pub fn default_data_path() -> String {
    "./data".to_string() // Default dev path; normalized to absolute at runtime
}

pub fn default_max_page_size() -> usize {
    1000
}

pub fn default_write_buffer_size() -> usize {
    8 * 1024 * 1024
}

pub fn default_max_write_buffers() -> i32 {
    2
}

pub fn default_max_open_files() -> i32 {
    512
}

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_log_format() -> String {
    "compact".to_string()
}

pub fn default_log_file() -> String {
    "./logs/idtable.log".to_string()
}
