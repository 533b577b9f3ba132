pub mod alert;
pub mod client;
pub mod deposit;
pub mod job_lease;
pub mod movement;
pub mod product;
pub mod sequence_counter;
pub mod site;

pub mod prelude {
    pub use super::alert::Entity as Alert;
    pub use super::client::Entity as Client;
    pub use super::deposit::Entity as Deposit;
    pub use super::job_lease::Entity as JobLease;
    pub use super::movement::Entity as Movement;
    pub use super::product::Entity as Product;
    pub use super::sequence_counter::Entity as SequenceCounter;
    pub use super::site::Entity as Site;
}
