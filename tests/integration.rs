#[path = "fixtures/mod.rs"]
mod fixtures;

mod integration {
    mod dkg_publication;
    mod moving_funds_action;
    mod redemption_action;
    mod spv_maintainer;
}
