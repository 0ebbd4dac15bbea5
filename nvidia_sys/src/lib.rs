//! Raw bindings to the CUDA driver API and NVENC, generated at build time.
//!
//! When the SDKs are not installed the crate builds empty (`nvidia_sys_stub`).

#[cfg(not(nvidia_sys_stub))]
pub mod cuda {
    include!(concat!(env!("OUT_DIR"), "/cuda.rs"));
}

#[cfg(not(nvidia_sys_stub))]
pub mod nvencodeapi {
    include!(concat!(env!("OUT_DIR"), "/nvencodeapi.rs"));

    pub const NVENCAPI_VERSION: u32 = WRAP_NVENCAPI_VERSION;
    pub const NV_ENCODE_API_FUNCTION_LIST_VER: u32 = WRAP_NV_ENCODE_API_FUNCTION_LIST_VER;
    pub const NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS_VER: u32 =
        WRAP_NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS_VER;
    pub const NV_ENC_INITIALIZE_PARAMS_VER: u32 = WRAP_NV_ENC_INITIALIZE_PARAMS_VER;
    pub const NV_ENC_CONFIG_VER: u32 = WRAP_NV_ENC_CONFIG_VER;
    pub const NV_ENC_PRESET_CONFIG_VER: u32 = WRAP_NV_ENC_PRESET_CONFIG_VER;
    pub const NV_ENC_CREATE_INPUT_BUFFER_VER: u32 = WRAP_NV_ENC_CREATE_INPUT_BUFFER_VER;
    pub const NV_ENC_CREATE_BITSTREAM_BUFFER_VER: u32 = WRAP_NV_ENC_CREATE_BITSTREAM_BUFFER_VER;
    pub const NV_ENC_LOCK_INPUT_BUFFER_VER: u32 = WRAP_NV_ENC_LOCK_INPUT_BUFFER_VER;
    pub const NV_ENC_LOCK_BITSTREAM_VER: u32 = WRAP_NV_ENC_LOCK_BITSTREAM_VER;
    pub const NV_ENC_PIC_PARAMS_VER: u32 = WRAP_NV_ENC_PIC_PARAMS_VER;
}

/// GUIDs declared as `static const` in nvEncodeAPI.h, which bindgen skips.
#[cfg(not(nvidia_sys_stub))]
#[allow(non_camel_case_types)]
pub mod guids {
    use crate::nvencodeapi::GUID;

    const fn guid(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> GUID {
        GUID {
            Data1: data1,
            Data2: data2,
            Data3: data3,
            Data4: data4,
        }
    }

    pub struct NV_ENC_CODEC;

    impl NV_ENC_CODEC {
        pub const H264: GUID = guid(
            0x6bc82762,
            0x4e63,
            0x4ca4,
            [0xaa, 0x85, 0x1e, 0x50, 0xf3, 0x21, 0xf6, 0xbf],
        );
        pub const HEVC: GUID = guid(
            0x790cdc88,
            0x4522,
            0x4d7b,
            [0x94, 0x25, 0xbd, 0xa9, 0x97, 0x5f, 0x76, 0x03],
        );
    }

    pub struct NV_ENC_PRESET;

    impl NV_ENC_PRESET {
        pub const P1: GUID = guid(
            0xfc0a8d3e,
            0x45f8,
            0x4cf8,
            [0x80, 0xc7, 0x29, 0x88, 0x71, 0x59, 0x0e, 0xbf],
        );
        pub const P2: GUID = guid(
            0xf581cfb8,
            0x88d6,
            0x4381,
            [0x93, 0xf0, 0xdf, 0x13, 0xf9, 0xc2, 0x7d, 0xab],
        );
        pub const P3: GUID = guid(
            0x36850110,
            0x3a07,
            0x441f,
            [0x94, 0xd5, 0x36, 0x70, 0x63, 0x1f, 0x91, 0xf6],
        );
        pub const P4: GUID = guid(
            0x90a7b826,
            0xdf06,
            0x4862,
            [0xb9, 0xd2, 0xcd, 0x6d, 0x73, 0xa0, 0x86, 0x81],
        );
        pub const P5: GUID = guid(
            0x21c6e6b4,
            0x297a,
            0x4cba,
            [0x99, 0x8f, 0xb6, 0xcb, 0xde, 0x72, 0xad, 0xe3],
        );
        pub const P6: GUID = guid(
            0x8e75c279,
            0x6299,
            0x4ab6,
            [0x83, 0x02, 0x0b, 0x21, 0x5a, 0x33, 0x5c, 0xf5],
        );
        pub const P7: GUID = guid(
            0x84848c12,
            0x6f71,
            0x4c13,
            [0x93, 0x1b, 0x53, 0xe2, 0x83, 0xf5, 0x79, 0x74],
        );
    }
}
