pub mod client;
pub mod provider;

pub use client::HttpFaceProvider;
pub use provider::{
    BoundingBox, CollectionFaceMatch, CompareFaceMatch, CompareFacesResponse, FaceProvider,
    ImageQuality, IndexFacesResponse, IndexedFace, Pose, QualityFilter, SearchFacesResponse,
    UnindexedFace,
};
