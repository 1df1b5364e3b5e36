use chrono::{DateTime, Utc};

use crate::models::node::group_node_id;

/// Root group every partition user belongs to.
pub const USERS_GROUP_NAME: &str = "users";
/// Group linked under new data groups when requested at creation.
pub const DATA_ROOT_GROUP_NAME: &str = "users.data.root";

pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

pub fn users_group_id(partition_id: &str, domain: &str) -> String {
    group_node_id(USERS_GROUP_NAME, partition_id, domain)
}

pub fn data_root_group_id(partition_id: &str, domain: &str) -> String {
    group_node_id(DATA_ROOT_GROUP_NAME, partition_id, domain)
}

/// Bootstrap groups are created per partition and never deleted or renamed.
pub fn is_bootstrap_group(node_id: &str, partition_id: &str, domain: &str) -> bool {
    node_id == users_group_id(partition_id, domain) || node_id == data_root_group_id(partition_id, domain)
}
