//! Entity module - `SeaORM` entity definitions, one per table.
//! Entities reference each other by id; there are no live object graphs.

pub mod agg_applied;
pub mod delivery_daily_agg;
pub mod delivery_order;
pub mod delivery_order_item;
pub mod outbox_event;
pub mod product;
pub mod product_daily_agg;
pub mod reservation;
pub mod system_state;
pub mod user;

// Re-export specific types to avoid conflicts
pub use agg_applied::{AggPhase, Entity as AggApplied};
pub use delivery_daily_agg::Entity as DeliveryDailyAgg;
pub use delivery_order::{DeliveryStatus, Entity as DeliveryOrder};
pub use delivery_order_item::Entity as DeliveryOrderItem;
pub use outbox_event::Entity as OutboxEvent;
pub use product::Entity as Product;
pub use product_daily_agg::Entity as ProductDailyAgg;
pub use reservation::{Entity as Reservation, ReservationStatus};
pub use system_state::Entity as SystemState;
pub use user::Entity as User;
