pub mod interface;
pub mod utils;

pub mod consts {
    /// 录制分块上传接口
    pub const CHUNK_UPLOAD_PATH: &str = "/api/live/recordings/chunk";
    /// OTA 版本检查接口
    pub const OTA_CHECK_PATH: &str = "/api/ota/check";
    /// OTA 发布接口（管理端）
    pub const OTA_UPLOAD_PATH: &str = "/api/ota/upload";
    /// OTA 版本列表接口，后接平台名
    pub const OTA_VERSIONS_PATH: &str = "/api/ota/versions";
    /// OTA 回滚接口（管理端）
    pub const OTA_ROLLBACK_PATH: &str = "/api/ota/rollback";

    /// 未记录任何 OTA 包时的默认版本
    pub const DEFAULT_BUNDLE_VERSION: &str = "0.0.0";
}
