pub mod market;
pub mod orders;
pub mod ring;

pub use market::{Direction, MarketPair};
pub use orders::{Order, OrderHash, OrderState, OrderStatus};
pub use ring::{
    closure_holds, FeeSelection, FilledOrder, Ring, RingHash, RingSubmitInfo, SubmitPhase,
    SubmitStatus, TxHash,
};
