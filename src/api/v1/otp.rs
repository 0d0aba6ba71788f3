use password_hash::rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOtpModel {
    #[serde(rename = "_id")]
    pub tracking_id: String,
    pub code: String,
    pub issued_at: bson::DateTime,
    pub consumed: bool,
    #[serde(default)]
    pub revoked: bool,
}

impl DeliveryOtpModel {
    pub fn issue(tracking_id: &str, digits: u32, issued_at: bson::DateTime) -> Self {
        Self {
            tracking_id: tracking_id.to_string(),
            code: generate_code(digits),
            issued_at,
            consumed: false,
            revoked: false,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.consumed && !self.revoked
    }

    pub fn matches(&self, code: &str) -> bool {
        let code = code.trim();

        code.len() == self.code.len()
            && self
                .code
                .bytes()
                .zip(code.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

pub fn generate_code(digits: u32) -> String {
    let bound = 10u64.pow(digits);
    let zone = u64::MAX - u64::MAX % bound;

    loop {
        let value = OsRng.next_u64();
        if value < zone {
            return format!("{:0width$}", value % bound, width = digits as usize);
        }
    }
}
