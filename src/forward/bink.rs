//! The Bink video API, forwarded to whichever real codec module loads first.

use std::ffi::{c_char, c_void};

/// Opaque codec handle.
#[repr(C)]
pub struct Bink {
    _private: [u8; 0],
}

crate::forward_table! {
    pub static BINK: BinkExports;

    fn BinkClose(bink: *mut Bink) = c"_BinkClose@4";
    fn BinkCopyToBufferRect(
        bink: *mut Bink,
        dst: *mut c_void,
        dst_pitch: i32,
        dst_height: u32,
        dst_x: u32,
        dst_y: u32,
        src_x: u32,
        src_y: u32,
        src_w: u32,
        src_h: u32,
        flags: u32,
    ) -> i32 = c"_BinkCopyToBufferRect@44";
    fn BinkDoFrame(bink: *mut Bink) -> i32 = c"_BinkDoFrame@4";
    fn BinkGetRects(bink: *mut Bink, flags: u32) -> i32 = c"_BinkGetRects@8";
    fn BinkNextFrame(bink: *mut Bink) = c"_BinkNextFrame@4";
    fn BinkOpen(path: *const c_char, flags: u32) -> *mut Bink = c"_BinkOpen@8";
    fn BinkOpenDirectSound(param: u32) -> *mut c_void = c"_BinkOpenDirectSound@4";
    fn BinkPause(bink: *mut Bink, pause: i32) -> i32 = c"_BinkPause@8";
    fn BinkSetSoundSystem(open: *mut c_void, param: u32) -> i32 = c"_BinkSetSoundSystem@8";
    fn BinkSetSoundTrack(total_tracks: u32, tracks: *mut u32) = c"_BinkSetSoundTrack@8";
    fn BinkSetVolume(bink: *mut Bink, track_id: u32, volume: i32) = c"_BinkSetVolume@12";
    fn BinkShouldSkip(bink: *mut Bink) -> i32 = c"_BinkShouldSkip@4";
    fn BinkWait(bink: *mut Bink) -> i32 = c"_BinkWait@4";

    // Later titles.
    fn BinkGoto(bink: *mut Bink, frame: u32, flags: i32) = c"_BinkGoto@12";
    fn BinkCopyToBuffer(
        bink: *mut Bink,
        buffer: *mut c_void,
        pitch: i32,
        height: i32,
        x: u32,
        y: u32,
        flags: u32,
    ) -> i32 = c"_BinkCopyToBuffer@28";
    fn BinkGetFrameBuffersInfo(bink: *mut Bink, frame_buffers: *mut c_void) = c"_BinkGetFrameBuffersInfo@8";
    fn BinkGetSummary(bink: *mut Bink, summary: *mut c_void) = c"_BinkGetSummary@8";
    fn BinkRegisterFrameBuffers(bink: *mut Bink, frame_buffers: *mut c_void) = c"_BinkRegisterFrameBuffers@8";
    fn BinkSetMemory(allocate: *mut c_void, free: *mut c_void) = c"_BinkSetMemory@8";

    // Not every binkw32 build exports these.
    fn BinkSetSpeakerVolumes(
        bink: *mut Bink,
        track_id: i32,
        speaker_indices: *mut u32,
        volumes: *mut i32,
        total: u32,
    ) = c"_BinkSetSpeakerVolumes@20";
    fn BinkGetTrackID(bink: *mut Bink, track_index: u32) = c"_BinkGetTrackID@8";
    fn BinkSetPan(bink: *mut Bink, track_id: u32, pan: i32) = c"_BinkSetPan@12";

    // Bink 2.
    fn BinkStartAsyncThread(thread_num: i32, param: *const c_void) -> i32 = c"_BinkStartAsyncThread@8";
    fn BinkSetOSFileCallbacks(
        open: *mut c_void,
        read: *mut c_void,
        seek: *mut c_void,
        close: *mut c_void,
    ) = c"_BinkSetOSFileCallbacks@16";
    fn BinkSetWillLoop(bink: *mut Bink, onoff: i32) = c"_BinkSetWillLoop@8";
    fn BinkDoFrameAsync(bink: *mut Bink, thread1: i32, thread2: i32) -> i32 = c"_BinkDoFrameAsync@12";
    fn BinkDoFrameAsyncWait(bink: *mut Bink, microseconds: i32) -> i32 = c"_BinkDoFrameAsyncWait@8";
    fn BinkOpenXAudio2(param: i32) -> *mut c_void = c"_BinkOpenXAudio2@4";
    fn BinkGetRealtime(a: u32, b: u32, c: u32) -> u32 = c"_BinkGetRealtime@12";
}
