pub mod constraint;
pub mod cost;
pub mod dynamics;
pub mod linear;
pub mod mode_schedule;
pub mod operating_point;
pub mod reference;
pub mod trajectory;
