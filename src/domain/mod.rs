pub mod dkg;
pub mod group;
pub mod redemption;
pub mod relay;
pub mod spv;
pub mod wallet;
