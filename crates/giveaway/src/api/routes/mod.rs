mod competitions;
mod draws;
mod payments;
mod system;

pub use competitions::*;
pub use draws::*;
pub use payments::*;
pub use system::*;
