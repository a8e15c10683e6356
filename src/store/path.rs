//! Path layout of the metadata store.
//!
//! Everything lives under `/cache-manager`. Group records are per product;
//! GSLB records live in a cross-product namespace keyed by GSLB name first,
//! so one balancer can serve several products.

pub const BASE_DIR: &str = "/cache-manager";

pub fn product_dir() -> String {
    format!("{}/products", BASE_DIR)
}

pub fn product_path(product: &str) -> String {
    format!("{}/products/{}", BASE_DIR, product)
}

pub fn topom_path(product: &str) -> String {
    format!("{}/products/{}/topom", BASE_DIR, product)
}

pub fn group_dir(product: &str) -> String {
    format!("{}/products/{}/groups", BASE_DIR, product)
}

pub fn group_path(product: &str, group: &str) -> String {
    format!("{}/products/{}/groups/group-{}", BASE_DIR, product, group)
}

pub fn sentinel_path(product: &str) -> String {
    format!("{}/products/{}/sentinel", BASE_DIR, product)
}

pub fn gslb_dir() -> String {
    format!("{}/gslb", BASE_DIR)
}

pub fn gslb_path(gslb: &str, product: &str) -> String {
    format!("{}/gslb/{}/{}", BASE_DIR, gslb, product)
}

pub fn template_file_dir() -> String {
    format!("{}/template-files", BASE_DIR)
}

pub fn template_file_path(file_name: &str) -> String {
    format!("{}/template-files/{}", BASE_DIR, file_name)
}

/// Last component of a store path.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
