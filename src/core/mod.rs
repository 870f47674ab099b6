pub mod backend;
pub mod enroll;
pub mod illumination;
pub mod onnx;

pub use backend::{
    create_backend, DetectorKind, FaceEncoding, FaceRectangle, LandmarkPoint, LandmarkSet,
    RecognitionBackend,
};
pub use enroll::{
    resolve_label, Enrollment, EnrollmentOptions, EnrollmentOutcome, LabelChoice, LabelPrompt,
    StdinPrompt, MAX_FRAMES,
};
pub use illumination::{
    classify_histogram, histogram, Clahe, DarknessVerdict, FrameClass, GateStats, IlluminationGate,
};
pub use onnx::OnnxBackend;
