mod echo;
mod health;
mod limited;
mod slow;

pub use echo::echo;
pub use health::health_check;
pub use limited::{limited, tenant};
pub use slow::{panic, slow};
