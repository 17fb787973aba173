use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Declares a text-backed status enum: `as_str`, `FromStr`, `TryFrom<String>`
/// (for `#[sqlx(try_from = "String")]`) and snake_case serde.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(EngineError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = EngineError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

text_enum!(
    /// Kind of monetary movement recorded in the ledger.
    LedgerEntryType, "ledger entry type" {
        SponsorCommission => "sponsor_commission",
        RepurchaseCommission => "repurchase_commission",
        SelfJoiningInstalment => "self_joining_instalment",
        WithdrawalRequest => "withdrawal_request",
        Withdrawal => "withdrawal",
        WithdrawalReversal => "withdrawal_reversal",
        PoolIncome => "pool_income",
    }
);

text_enum!(
    OrderStatus, "order status" {
        Pending => "pending",
        Paid => "paid",
        Delivered => "delivered",
    }
);

impl OrderStatus {
    /// Delivered orders were paid first, so they count as paid for commissions.
    pub fn is_paid(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Delivered)
    }
}

text_enum!(
    PayoutStatus, "payout status" {
        Scheduled => "scheduled",
        Processed => "processed",
    }
);

text_enum!(
    WithdrawalStatus, "withdrawal status" {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
);

text_enum!(
    KycStatus, "kyc status" {
        NotSubmitted => "not_submitted",
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
);

/// A platform member.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    /// The ID of the user.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Assigned on activation.
    pub referral_code: Option<String>,
    /// The user who referred this one.
    pub sponsor_id: Option<i64>,
    /// Materialized sum of the user's ledger entries, in paisa.
    pub wallet_balance: i64,
    /// Purchases processed since the last closed pool period, in paisa.
    pub monthly_purchase: i64,
    pub is_active: bool,
    #[sqlx(try_from = "String")]
    pub kyc_status: KycStatus,
    pub kyc_reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An order as seen by the engine.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    /// The buyer.
    pub user_id: i64,
    /// Commissionable value, in paisa.
    pub total: i64,
    #[sqlx(try_from = "String")]
    pub status: OrderStatus,
    pub is_joining_order: bool,
    pub paid_at: Option<DateTime<Utc>>,
    /// Set once commissions for the order were credited.
    pub commission_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An immutable ledger entry.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: i64,
    #[sqlx(try_from = "String")]
    pub entry_type: LedgerEntryType,
    /// Signed amount in paisa; debits are negative.
    pub amount: i64,
    /// Hierarchy level for commissions, 0 otherwise.
    pub level_depth: i32,
    /// What caused the movement, e.g. `order:<uuid>`.
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

/// One row of the hierarchy closure table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::FromRow)]
pub struct HierarchyLink {
    pub ancestor_id: i64,
    pub descendant_id: i64,
    pub depth: i32,
}

/// A deferred installment of the self-income joining bonus.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SelfPayout {
    pub id: i64,
    pub user_id: i64,
    pub order_id: Uuid,
    pub instalment_no: i32,
    pub amount: i64,
    pub due_at: DateTime<Utc>,
    #[sqlx(try_from = "String")]
    pub status: PayoutStatus,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A withdrawal request. Pending requests hold funds without debiting them.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Withdrawal {
    pub id: Uuid,
    pub user_id: i64,
    pub amount: i64,
    #[sqlx(try_from = "String")]
    pub status: WithdrawalStatus,
    pub reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// The record of one turnover pool run.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PoolDistribution {
    /// Calendar month, `YYYY-MM`.
    pub period: String,
    pub turnover: i64,
    pub pool_amount: i64,
    pub recipients: i64,
    /// What each recipient received.
    pub share: i64,
    pub undistributed: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_parse_their_own_text() {
        for t in [
            LedgerEntryType::SponsorCommission,
            LedgerEntryType::RepurchaseCommission,
            LedgerEntryType::SelfJoiningInstalment,
            LedgerEntryType::WithdrawalRequest,
            LedgerEntryType::Withdrawal,
            LedgerEntryType::WithdrawalReversal,
            LedgerEntryType::PoolIncome,
        ] {
            assert_eq!(t.as_str().parse::<LedgerEntryType>(), Ok(t));
        }
        assert_eq!("not_submitted".parse::<KycStatus>(), Ok(KycStatus::NotSubmitted));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "refunded".parse::<OrderStatus>().unwrap_err();
        assert_eq!(
            err,
            EngineError::UnknownVariant {
                kind: "order status",
                value: "refunded".into()
            }
        );
    }

    #[test]
    fn delivered_counts_as_paid() {
        assert!(OrderStatus::Delivered.is_paid());
        assert!(OrderStatus::Paid.is_paid());
        assert!(!OrderStatus::Pending.is_paid());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&LedgerEntryType::SelfJoiningInstalment).unwrap();
        assert_eq!(json, "\"self_joining_instalment\"");
    }
}
