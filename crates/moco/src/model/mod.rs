//! Model components: encoder backbone, projection/prediction MLPs, the
//! embedding normalizer, and the momentum-coupled online/target pair.

pub mod bridge;
pub mod encoder;
pub mod mlp;
pub mod momentum;
pub mod params;
pub mod tower;
