//! Stores and the products they link to nodes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{check_length, check_urls, is_valid_url, ValidationError};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instagram: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facebook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter: Option<String>,
}

impl ContactInfo {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(email) = self.email.as_deref().filter(|e| !e.is_empty()) {
            if !email.contains('@') {
                return Err(ValidationError::new("contact.email", "invalid e-mail"));
            }
        }
        if let Some(website) = self.website.as_deref().filter(|w| !w.is_empty()) {
            if !is_valid_url(website) {
                return Err(ValidationError::new("contact.website", "invalid URL"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub contact: ContactInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default)]
    pub products: BTreeSet<String>,
    #[serde(default = "default_store_status")]
    pub status: String,
    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_store_status() -> String {
    "active".to_string()
}

impl Store {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_length("name", &self.name, 1, 100)?;
        check_length("description", &self.description, 10, 1000)?;
        if let Some(logo) = self.logo.as_deref().filter(|l| !l.is_empty()) {
            if !is_valid_url(logo) {
                return Err(ValidationError::new("logo", "invalid URL"));
            }
        }
        self.contact.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStoreRequest {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub contact: ContactInfo,
    #[serde(default)]
    pub logo: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStoreRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub contact: Option<ContactInfo>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl UpdateStoreRequest {
    pub fn apply(self, store: &mut Store) {
        if let Some(name) = self.name {
            store.name = name;
        }
        if let Some(description) = self.description {
            store.description = description;
        }
        if let Some(contact) = self.contact {
            store.contact = contact;
        }
        if let Some(logo) = self.logo {
            store.logo = Some(logo);
        }
        if let Some(status) = self.status {
            store.status = status;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    #[default]
    Pending,
    Active,
    Inactive,
    Rejected,
}

impl From<ApprovalStatus> for ProductStatus {
    fn from(status: ApprovalStatus) -> Self {
        match status {
            ApprovalStatus::Pending => ProductStatus::Pending,
            ApprovalStatus::Approved => ProductStatus::Active,
            ApprovalStatus::Rejected => ProductStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(default)]
    pub id: String,
    pub store_id: String,
    pub node_id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub price: f64,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub contact: ContactInfo,
    pub donation_percent: u32,
    #[serde(default)]
    pub approval_status: ApprovalStatus,
    #[serde(default)]
    pub status: ProductStatus,
    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_length("name", &self.name, 1, 100)?;
        check_length("description", &self.description, 10, 1000)?;
        if !(self.price.is_finite() && self.price > 0.0) {
            return Err(ValidationError::new("price", "must be greater than 0"));
        }
        check_urls("images", &self.images, 1, 5)?;
        if !(1..=100).contains(&self.donation_percent) {
            return Err(ValidationError::new(
                "donationPercent",
                "must be between 1 and 100",
            ));
        }
        self.contact.validate()
    }

    pub fn set_approval(&mut self, status: ApprovalStatus) {
        self.approval_status = status;
        self.status = status.into();
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductRequest {
    pub store_id: String,
    pub node_id: String,
    pub name: String,
    pub description: String,
    pub price: f64,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub contact: ContactInfo,
    pub donation_percent: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProductRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub images: Option<Vec<String>>,
    #[serde(default)]
    pub contact: Option<ContactInfo>,
    #[serde(default)]
    pub donation_percent: Option<u32>,
    /// Only `active` and `inactive` are accepted; approval drives the rest
    #[serde(default)]
    pub status: Option<ProductStatus>,
}

impl UpdateProductRequest {
    pub fn apply(self, product: &mut Product) -> Result<(), ValidationError> {
        if let Some(status) = self.status {
            let allowed = product.approval_status == ApprovalStatus::Approved
                && matches!(status, ProductStatus::Active | ProductStatus::Inactive);
            if !allowed {
                return Err(ValidationError::new(
                    "status",
                    "only approved products can be activated or deactivated",
                ));
            }
            product.status = status;
        }
        if let Some(name) = self.name {
            product.name = name;
        }
        if let Some(description) = self.description {
            product.description = description;
        }
        if let Some(price) = self.price {
            product.price = price;
        }
        if let Some(images) = self.images {
            product.images = images;
        }
        if let Some(contact) = self.contact {
            product.contact = contact;
        }
        if let Some(donation_percent) = self.donation_percent {
            product.donation_percent = donation_percent;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_product() -> Product {
        serde_json::from_value(json!({
            "storeId": "s1",
            "nodeId": "n1",
            "userId": "u1",
            "name": "Tote bag",
            "description": "Organic cotton tote bag",
            "price": 12.5,
            "images": ["https://example.org/tote.jpg"],
            "donationPercent": 10
        }))
        .unwrap()
    }

    #[test]
    fn test_product_validation() {
        let mut product = sample_product();
        assert!(product.validate().is_ok());

        product.donation_percent = 0;
        assert_eq!(product.validate().unwrap_err().field, "donationPercent");

        product = sample_product();
        product.price = 0.0;
        assert_eq!(product.validate().unwrap_err().field, "price");

        product = sample_product();
        product.images.clear();
        assert_eq!(product.validate().unwrap_err().field, "images");

        product = sample_product();
        product.contact.website = Some("nope".to_string());
        assert_eq!(product.validate().unwrap_err().field, "contact.website");
    }

    #[test]
    fn test_approval_drives_status() {
        let mut product = sample_product();
        assert_eq!(product.status, ProductStatus::Pending);
        product.set_approval(ApprovalStatus::Approved);
        assert_eq!(product.status, ProductStatus::Active);
        product.set_approval(ApprovalStatus::Rejected);
        assert_eq!(product.status, ProductStatus::Rejected);
    }

    #[test]
    fn test_pending_product_cannot_be_activated_directly() {
        let mut product = sample_product();
        let update = UpdateProductRequest {
            status: Some(ProductStatus::Active),
            ..Default::default()
        };
        assert!(update.apply(&mut product).is_err());
    }
}
