// OTA (Over-The-Air) update module

pub mod applier;
pub mod fetcher;
pub mod partition;

pub use applier::{FinalizedImage, ImageExpectation, OtaApplier, OtaStatus, IMAGE_MAGIC};
pub use fetcher::{FirmwareFetcher, FirmwareImage, ImageSink, Manifest, MANIFEST_FILE};
pub use partition::{role_of, PartitionId, PartitionInfo, PartitionRole, PartitionStorage};

// OTA update flow:
// 1. GET <base>/latest.txt and parse the candidate build number
// 2. Compare with the running build; stop unless strictly newer
// 3. Erase the inactive slot and stream the image into it
// 4. Verify length, header and digest
// 5. Set boot partition
// 6. Restart
