//! Payments: PIX transaction lifecycle, the exactly-once sale-approved
//! fan-out, upsell activation and delivery, credit wallet pricing, and the
//! sale-notification task.

pub mod credits;
pub mod fanout;
pub mod notify;
pub mod transactions;
pub mod upsells;

pub use credits::CreditService;
pub use fanout::{SaleApprovedHandler, SALE_APPROVED_TASK};
pub use notify::{SaleNotificationHandler, SALE_NOTIFICATION_TASK};
pub use transactions::{PaymentPoll, PaymentService};
pub use upsells::DeliverUpsellHandler;
