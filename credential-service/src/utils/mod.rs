pub mod clock;
pub mod password;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use password::{hash_password, verify_password, Password, PasswordHashString};
pub use validation::ValidatedJson;
